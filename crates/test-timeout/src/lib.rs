use proc_macro::TokenStream;
use proc_macro2::Span;
use quote::quote;
use syn::parse::{Parse, ParseStream};
use syn::{Attribute, Ident, ItemFn, LitInt, Token, parse_macro_input};

const DEFAULT_TIMEOUT_SECS: u64 = 30;

/// Wall-clock limit accepted as `(15)` or `(secs = 15)`.
struct TimeoutArgs {
    secs: u64,
}

impl Parse for TimeoutArgs {
    fn parse(input: ParseStream) -> syn::Result<Self> {
        if input.is_empty() {
            return Ok(Self {
                secs: DEFAULT_TIMEOUT_SECS,
            });
        }
        if input.peek(Ident) {
            let key: Ident = input.parse()?;
            if key != "secs" {
                return Err(syn::Error::new(key.span(), "expected `secs = <integer>`"));
            }
            input.parse::<Token![=]>()?;
        }
        let lit: LitInt = input.parse()?;
        let secs: u64 = lit.base10_parse()?;
        if secs == 0 {
            return Err(syn::Error::new(lit.span(), "timeout must be greater than zero"));
        }
        Ok(Self { secs })
    }
}

/// Runs an async test on its own current-thread Tokio runtime and fails it
/// if it has not finished within the limit, even when the runtime itself is
/// wedged.
#[proc_macro_attribute]
pub fn tokio_timeout_test(attr: TokenStream, item: TokenStream) -> TokenStream {
    let TimeoutArgs { secs } = parse_macro_input!(attr as TimeoutArgs);
    let ItemFn {
        attrs,
        vis,
        mut sig,
        block,
    } = parse_macro_input!(item as ItemFn);

    if sig.asyncness.take().is_none() {
        return syn::Error::new_spanned(&sig.fn_token, "tokio_timeout_test needs an async fn")
            .to_compile_error()
            .into();
    }

    let attrs: Vec<Attribute> = attrs.into_iter().filter(|a| !is_test_marker(a)).collect();
    let thread_name = syn::LitStr::new(&sig.ident.to_string(), Span::call_site());

    TokenStream::from(quote! {
        #[test]
        #(#attrs)*
        #vis #sig {
            let limit = ::std::time::Duration::from_secs(#secs);
            let (done_tx, done_rx) = ::std::sync::mpsc::channel();
            ::std::thread::Builder::new()
                .name(#thread_name.to_string())
                .spawn(move || {
                    let outcome = ::std::panic::catch_unwind(::std::panic::AssertUnwindSafe(|| {
                        let runtime = ::tokio::runtime::Builder::new_current_thread()
                            .enable_all()
                            .build()
                            .expect("failed to build Tokio runtime");
                        runtime.block_on(async move {
                            if ::tokio::time::timeout(limit, async move #block).await.is_err() {
                                panic!("test exceeded {}s", #secs);
                            }
                        });
                    }));
                    let _ = done_tx.send(outcome);
                })
                .expect("failed to spawn test thread");
            match done_rx.recv_timeout(limit + ::std::time::Duration::from_secs(1)) {
                Ok(Ok(())) => {}
                Ok(Err(payload)) => ::std::panic::resume_unwind(payload),
                Err(::std::sync::mpsc::RecvTimeoutError::Timeout) => {
                    panic!("test exceeded {}s and its runtime did not yield", #secs)
                }
                Err(::std::sync::mpsc::RecvTimeoutError::Disconnected) => {
                    panic!("test thread exited without reporting")
                }
            }
        }
    })
}

/// Matches `#[test]` and `#[tokio::test]` so they are not applied twice.
fn is_test_marker(attr: &Attribute) -> bool {
    let idents: Vec<String> = attr
        .path()
        .segments
        .iter()
        .map(|segment| segment.ident.to_string())
        .collect();
    matches!(idents.as_slice(), [only] if only == "test")
        || matches!(idents.as_slice(), [first, second] if first == "tokio" && second == "test")
}
