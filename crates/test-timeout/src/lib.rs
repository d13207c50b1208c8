use proc_macro::TokenStream;
use proc_macro2::TokenStream as TokenStream2;
use quote::quote;
use syn::{
    Attribute, Expr, ExprLit, ItemFn, Lit, Meta, Token, parse::Parser, parse_macro_input,
    punctuated::Punctuated,
};

const DEFAULT_TIMEOUT_SECS: u64 = 30;

#[derive(Clone, Copy, PartialEq, Eq)]
enum Flavor {
    CurrentThread,
    MultiThread,
}

struct TestArgs {
    timeout_secs: u64,
    flavor: Flavor,
    worker_threads: usize,
}

impl Default for TestArgs {
    fn default() -> Self {
        Self {
            timeout_secs: DEFAULT_TIMEOUT_SECS,
            flavor: Flavor::CurrentThread,
            worker_threads: 2,
        }
    }
}

/// Runs an async test on a dedicated Tokio runtime and fails it once the
/// wall-clock budget is exhausted.
///
/// Accepted forms: `#[tokio_timeout_test]`, `#[tokio_timeout_test(10)]`,
/// `#[tokio_timeout_test(secs = 10, flavor = "multi_thread", worker_threads = 4)]`.
#[proc_macro_attribute]
pub fn tokio_timeout_test(attr: TokenStream, item: TokenStream) -> TokenStream {
    let args = match parse_args(attr.into()) {
        Ok(args) => args,
        Err(err) => return err.to_compile_error().into(),
    };

    let ItemFn {
        attrs,
        vis,
        mut sig,
        block,
    } = parse_macro_input!(item as ItemFn);

    if sig.asyncness.is_none() {
        return syn::Error::new_spanned(
            &sig.ident,
            "tokio_timeout_test can only be applied to async functions",
        )
        .to_compile_error()
        .into();
    }

    sig.asyncness = None;

    let filtered_attrs: Vec<Attribute> = attrs
        .into_iter()
        .filter(|attr| !is_tokio_test_attribute(attr))
        .collect();

    let timeout = args.timeout_secs;
    let builder = match args.flavor {
        Flavor::CurrentThread => quote! { tokio::runtime::Builder::new_current_thread() },
        Flavor::MultiThread => {
            let workers = args.worker_threads;
            quote! {
                {
                    let mut builder = tokio::runtime::Builder::new_multi_thread();
                    builder.worker_threads(#workers);
                    builder
                }
            }
        }
    };

    TokenStream::from(quote! {
        #[test]
        #(#filtered_attrs)*
        #vis #sig {
            let timeout_duration = std::time::Duration::from_secs(#timeout);
            let (sender, receiver) = std::sync::mpsc::channel();
            std::thread::spawn(move || {
                let result = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| {
                    let runtime = #builder
                        .enable_all()
                        .build()
                        .expect("failed to build Tokio runtime");
                    runtime.block_on(async {
                        tokio::time::timeout(timeout_duration, async move #block)
                            .await
                            .expect("test timed out");
                    });
                }));
                let _ = sender.send(result);
            });
            // Leave headroom for runtime teardown after the inner timeout fires.
            match receiver.recv_timeout(timeout_duration + std::time::Duration::from_secs(1)) {
                Ok(Ok(_)) => {}
                Ok(Err(payload)) => std::panic::resume_unwind(payload),
                Err(std::sync::mpsc::RecvTimeoutError::Timeout) => panic!("test timed out"),
                Err(std::sync::mpsc::RecvTimeoutError::Disconnected) => {
                    panic!("test thread failed before reporting result")
                }
            }
        }
    })
}

fn parse_args(attr: TokenStream2) -> syn::Result<TestArgs> {
    let mut args = TestArgs::default();
    if attr.is_empty() {
        return Ok(args);
    }

    // Bare integer shorthand: `#[tokio_timeout_test(10)]`.
    if let Ok(lit) = syn::parse2::<syn::LitInt>(attr.clone()) {
        args.timeout_secs = positive(&lit)?;
        return Ok(args);
    }

    let metas = Punctuated::<Meta, Token![,]>::parse_terminated.parse2(attr)?;
    for meta in metas {
        let Meta::NameValue(pair) = &meta else {
            return Err(syn::Error::new_spanned(meta, "expected `key = value`"));
        };
        let key = pair
            .path
            .get_ident()
            .map(|ident| ident.to_string())
            .unwrap_or_default();
        match (key.as_str(), &pair.value) {
            (
                "secs",
                Expr::Lit(ExprLit {
                    lit: Lit::Int(lit), ..
                }),
            ) => args.timeout_secs = positive(lit)?,
            (
                "worker_threads",
                Expr::Lit(ExprLit {
                    lit: Lit::Int(lit), ..
                }),
            ) => args.worker_threads = positive(lit)? as usize,
            (
                "flavor",
                Expr::Lit(ExprLit {
                    lit: Lit::Str(lit), ..
                }),
            ) => {
                args.flavor = match lit.value().as_str() {
                    "current_thread" => Flavor::CurrentThread,
                    "multi_thread" => Flavor::MultiThread,
                    other => {
                        return Err(syn::Error::new_spanned(
                            lit,
                            format!("unknown runtime flavor `{other}`"),
                        ));
                    }
                }
            }
            _ => {
                return Err(syn::Error::new_spanned(
                    &pair.path,
                    "supported arguments: secs, flavor, worker_threads",
                ));
            }
        }
    }
    Ok(args)
}

fn positive(lit: &syn::LitInt) -> syn::Result<u64> {
    let value: u64 = lit.base10_parse()?;
    if value == 0 {
        return Err(syn::Error::new_spanned(lit, "value must be greater than zero"));
    }
    Ok(value)
}

fn is_tokio_test_attribute(attr: &Attribute) -> bool {
    let mut segments = attr.path().segments.iter();
    matches!(
        (segments.next(), segments.next(), segments.next()),
        (Some(first), Some(second), None)
            if first.ident == "tokio" && second.ident == "test"
    )
}
