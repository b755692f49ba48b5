//! Test attributes that fail a test instead of letting it hang.
//!
//! `#[tokio_timeout_test]` runs an async test body on its own runtime inside a
//! watchdog thread:
//!
//! ```ignore
//! #[test_timeout::tokio_timeout_test]
//! async fn default_budget() {}
//!
//! #[test_timeout::tokio_timeout_test(secs = 5, flavor = "multi_thread", workers = 2)]
//! async fn explicit_budget() {}
//! ```
//!
//! `#[timeout(secs = N)]` does the same for synchronous tests.

use proc_macro::TokenStream;
use proc_macro2::TokenStream as TokenStream2;
use quote::quote;
use syn::meta::ParseNestedMeta;
use syn::{parse_macro_input, Attribute, ItemFn, LitInt, LitStr};

const DEFAULT_SECS: u64 = 30;

#[derive(Clone, Copy, PartialEq, Eq)]
enum Flavor {
    CurrentThread,
    MultiThread,
}

struct TimeoutArgs {
    secs: u64,
    flavor: Flavor,
    workers: Option<usize>,
}

impl Default for TimeoutArgs {
    fn default() -> Self {
        Self {
            secs: DEFAULT_SECS,
            flavor: Flavor::CurrentThread,
            workers: None,
        }
    }
}

impl TimeoutArgs {
    fn parse(&mut self, meta: ParseNestedMeta) -> syn::Result<()> {
        if meta.path.is_ident("secs") {
            let lit: LitInt = meta.value()?.parse()?;
            let secs: u64 = lit.base10_parse()?;
            if secs == 0 {
                return Err(syn::Error::new_spanned(lit, "timeout must be non-zero"));
            }
            self.secs = secs;
            Ok(())
        } else if meta.path.is_ident("flavor") {
            let lit: LitStr = meta.value()?.parse()?;
            self.flavor = match lit.value().as_str() {
                "current_thread" => Flavor::CurrentThread,
                "multi_thread" => Flavor::MultiThread,
                _ => {
                    return Err(syn::Error::new_spanned(
                        lit,
                        "flavor must be \"current_thread\" or \"multi_thread\"",
                    ))
                }
            };
            Ok(())
        } else if meta.path.is_ident("workers") {
            let lit: LitInt = meta.value()?.parse()?;
            self.workers = Some(lit.base10_parse()?);
            Ok(())
        } else {
            Err(meta.error("expected `secs`, `flavor` or `workers`"))
        }
    }
}

fn parse_args(attr: TokenStream) -> syn::Result<TimeoutArgs> {
    let mut args = TimeoutArgs::default();
    if attr.is_empty() {
        return Ok(args);
    }
    let parser = syn::meta::parser(|meta| args.parse(meta));
    syn::parse::Parser::parse(parser, attr)?;
    if args.workers.is_some() && args.flavor == Flavor::CurrentThread {
        return Err(syn::Error::new(
            proc_macro2::Span::call_site(),
            "`workers` requires flavor = \"multi_thread\"",
        ));
    }
    Ok(args)
}

#[proc_macro_attribute]
pub fn tokio_timeout_test(attr: TokenStream, item: TokenStream) -> TokenStream {
    let args = match parse_args(attr) {
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
        return syn::Error::new_spanned(&sig.ident, "tokio_timeout_test expects an async fn")
            .to_compile_error()
            .into();
    }
    sig.asyncness = None;

    let builder = match args.flavor {
        Flavor::CurrentThread => quote! { tokio::runtime::Builder::new_current_thread() },
        Flavor::MultiThread => {
            let workers = args.workers.unwrap_or(2);
            quote! {{
                let mut builder = tokio::runtime::Builder::new_multi_thread();
                builder.worker_threads(#workers);
                builder
            }}
        }
    };
    let secs = args.secs;
    let body = quote! {
        let runtime = #builder
            .enable_all()
            .build()
            .expect("build test runtime");
        runtime.block_on(async move {
            tokio::time::timeout(std::time::Duration::from_secs(#secs), async move #block)
                .await
                .expect("test timed out");
        });
    };

    let attrs = strip_test_attributes(attrs);
    watchdog(attrs, vis, sig, secs, body).into()
}

#[proc_macro_attribute]
pub fn timeout(attr: TokenStream, item: TokenStream) -> TokenStream {
    let args = match parse_args(attr) {
        Ok(args) => args,
        Err(err) => return err.to_compile_error().into(),
    };
    let ItemFn {
        attrs,
        vis,
        sig,
        block,
    } = parse_macro_input!(item as ItemFn);

    if sig.asyncness.is_some() {
        return syn::Error::new_spanned(
            &sig.ident,
            "timeout expects a synchronous fn; use tokio_timeout_test for async tests",
        )
        .to_compile_error()
        .into();
    }

    let attrs = strip_test_attributes(attrs);
    watchdog(attrs, vis, sig, args.secs, quote! { #block; }).into()
}

/// Runs `body` on a fresh thread and fails the test if it outlives `secs`.
fn watchdog(
    attrs: Vec<Attribute>,
    vis: syn::Visibility,
    sig: syn::Signature,
    secs: u64,
    body: TokenStream2,
) -> TokenStream2 {
    let name = sig.ident.to_string();
    quote! {
        #[test]
        #(#attrs)*
        #vis #sig {
            let budget = std::time::Duration::from_secs(#secs);
            let (done_tx, done_rx) = std::sync::mpsc::channel();
            std::thread::Builder::new()
                .name(#name.into())
                .spawn(move || {
                    let outcome = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| {
                        #body
                    }));
                    let _ = done_tx.send(outcome);
                })
                .expect("spawn test thread");
            match done_rx.recv_timeout(budget) {
                Ok(Ok(())) => {}
                Ok(Err(panic)) => std::panic::resume_unwind(panic),
                Err(std::sync::mpsc::RecvTimeoutError::Timeout) => {
                    panic!("{} exceeded {:?}", #name, budget)
                }
                Err(std::sync::mpsc::RecvTimeoutError::Disconnected) => {
                    panic!("{} exited without reporting", #name)
                }
            }
        }
    }
}

/// Drops `#[test]` and `#[tokio::test]` so the generated `#[test]` is the only one.
fn strip_test_attributes(attrs: Vec<Attribute>) -> Vec<Attribute> {
    attrs
        .into_iter()
        .filter(|attr| {
            let segments: Vec<String> = attr
                .path()
                .segments
                .iter()
                .map(|segment| segment.ident.to_string())
                .collect();
            !matches!(
                segments.iter().map(String::as_str).collect::<Vec<_>>().as_slice(),
                ["test"] | ["tokio", "test"]
            )
        })
        .collect()
}
