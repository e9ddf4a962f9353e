//! Test attributes that fail a test instead of letting it hang.
//!
//! `#[timeout]` wraps a synchronous test, `#[tokio_timeout_test]` builds a
//! current-thread runtime for an async one. Both take an optional limit in
//! seconds: `#[timeout(5)]`. The async form also accepts `start_paused`,
//! which runs the test on a paused clock; the limit is then enforced on
//! wall time only.

use proc_macro::TokenStream;
use proc_macro2::TokenStream as TokenStream2;
use quote::quote;
use syn::parse::{Parse, ParseStream, Parser};
use syn::punctuated::Punctuated;
use syn::{parse_macro_input, Attribute, Ident, ItemFn, LitInt, Token};

const DEFAULT_TIMEOUT_SECS: u64 = 60;

struct Options {
    limit: u64,
    start_paused: bool,
}

enum Arg {
    Limit(LitInt),
    StartPaused,
}

impl Parse for Arg {
    fn parse(input: ParseStream) -> syn::Result<Self> {
        if input.peek(LitInt) {
            return input.parse().map(Arg::Limit);
        }
        let ident: Ident = input.parse()?;
        if ident == "start_paused" {
            Ok(Arg::StartPaused)
        } else {
            Err(syn::Error::new_spanned(ident, "expected a limit in seconds or `start_paused`"))
        }
    }
}

#[proc_macro_attribute]
pub fn tokio_timeout_test(attr: TokenStream, item: TokenStream) -> TokenStream {
    let function = parse_macro_input!(item as ItemFn);
    let Options {
        limit,
        start_paused,
    } = match parse_options(attr) {
        Ok(options) => options,
        Err(err) => return err.to_compile_error().into(),
    };
    if function.sig.asyncness.is_none() {
        return syn::Error::new_spanned(
            &function.sig.ident,
            "tokio_timeout_test expects an async fn",
        )
        .to_compile_error()
        .into();
    }

    let block = &function.block;
    // A paused clock auto-advances past any in-runtime deadline.
    let run = if start_paused {
        quote! { runtime.block_on(async move #block); }
    } else {
        quote! {
            runtime.block_on(async move {
                tokio::time::timeout(__limit, async move #block)
                    .await
                    .expect("test timed out");
            });
        }
    };
    let paused = start_paused.then(|| quote! { .start_paused(true) });
    let body = quote! {
        let runtime = tokio::runtime::Builder::new_current_thread()
            .enable_all()
            #paused
            .build()
            .expect("failed to build Tokio runtime");
        #run
    };
    guarded(function, limit, body, is_tokio_test).into()
}

#[proc_macro_attribute]
pub fn timeout(attr: TokenStream, item: TokenStream) -> TokenStream {
    let function = parse_macro_input!(item as ItemFn);
    let limit = match parse_options(attr) {
        Ok(Options {
            start_paused: true, ..
        }) => {
            return syn::Error::new_spanned(
                &function.sig.ident,
                "start_paused needs an async fn; use tokio_timeout_test",
            )
            .to_compile_error()
            .into()
        }
        Ok(options) => options.limit,
        Err(err) => return err.to_compile_error().into(),
    };
    if function.sig.asyncness.is_some() {
        return syn::Error::new_spanned(
            &function.sig.ident,
            "timeout expects a synchronous fn; use tokio_timeout_test",
        )
        .to_compile_error()
        .into();
    }

    let block = &function.block;
    let body = quote! { #block };
    guarded(function, limit, body, is_plain_test).into()
}

fn parse_options(attr: TokenStream) -> syn::Result<Options> {
    let mut options = Options {
        limit: DEFAULT_TIMEOUT_SECS,
        start_paused: false,
    };
    let args = Punctuated::<Arg, Token![,]>::parse_terminated.parse(attr)?;
    for arg in args {
        match arg {
            Arg::Limit(lit) => {
                let secs: u64 = lit.base10_parse()?;
                if secs == 0 {
                    return Err(syn::Error::new_spanned(
                        lit,
                        "timeout must be at least one second",
                    ));
                }
                options.limit = secs;
            }
            Arg::StartPaused => options.start_paused = true,
        }
    }
    Ok(options)
}

/// Emit a `#[test]` that runs `body` on a worker thread and panics if it
/// has not reported back within the limit.
fn guarded(
    function: ItemFn,
    limit: u64,
    body: TokenStream2,
    drop_attr: fn(&Attribute) -> bool,
) -> TokenStream2 {
    let ItemFn {
        attrs, vis, mut sig, ..
    } = function;
    sig.asyncness = None;
    let attrs = attrs.into_iter().filter(|attr| !drop_attr(attr));

    quote! {
        #[test]
        #(#attrs)*
        #vis #sig {
            let __limit = std::time::Duration::from_secs(#limit);
            let (__done, __report) = std::sync::mpsc::channel();
            std::thread::spawn(move || {
                let outcome = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| {
                    #body
                }));
                let _ = __done.send(outcome);
            });
            match __report.recv_timeout(__limit) {
                Ok(Ok(_)) => {}
                Ok(Err(payload)) => std::panic::resume_unwind(payload),
                Err(std::sync::mpsc::RecvTimeoutError::Timeout) => {
                    panic!("test exceeded {}s", #limit)
                }
                Err(std::sync::mpsc::RecvTimeoutError::Disconnected) => {
                    panic!("test thread exited without reporting")
                }
            }
        }
    }
}

fn is_plain_test(attr: &Attribute) -> bool {
    attr.path().is_ident("test")
}

fn is_tokio_test(attr: &Attribute) -> bool {
    let segments: Vec<_> = attr.path().segments.iter().map(|s| s.ident.to_string()).collect();
    segments == ["tokio", "test"]
}
