/*
 * Copyright (c) Meta Platforms, Inc. and affiliates.
 * All rights reserved.
 *
 * This source code is licensed under the BSD-style license found in the
 * LICENSE file in the root directory of this source tree.
 */

//! `#[timed_test(timeout_secs = N)]` runs a test body on a dedicated thread
//! and panics if it has not finished after `N` seconds. Plain `fn` tests run
//! the body directly; `async fn` tests get a fresh multi-threaded tokio
//! runtime. Polling loops that never converge therefore fail instead of
//! hanging the test binary.

use proc_macro::TokenStream;
use proc_macro2::TokenStream as TokenStream2;
use quote::quote;
use syn::Expr;
use syn::ItemFn;
use syn::Lit;
use syn::MetaNameValue;
use syn::ReturnType;
use syn::parse_macro_input;

/// A test macro that bounds the wall-clock time of a test.
///
/// # Examples
///
/// ```rust
/// # use timed_test::timed_test;
/// #[timed_test(timeout_secs = 5)]
/// fn converges() {
///     // Test that should complete within 5 seconds
/// }
///
/// #[timed_test(timeout_secs = 5)]
/// async fn converges_async() {
///     tokio::time::sleep(tokio::time::Duration::from_millis(10)).await;
/// }
/// ```
#[proc_macro_attribute]
pub fn timed_test(attr: TokenStream, input: TokenStream) -> TokenStream {
    let attr = parse_macro_input!(attr as MetaNameValue);
    let input_fn = parse_macro_input!(input as ItemFn);

    let timeout_secs = match parse_timeout(&attr) {
        Ok(secs) => secs,
        Err(err) => return TokenStream::from(err.to_compile_error()),
    };

    let fn_block = &input_fn.block;
    let fn_attrs = &input_fn.attrs;
    let fn_vis = &input_fn.vis;
    let sig = &input_fn.sig;
    let fn_name = &sig.ident;
    let output = &sig.output;

    if !sig.inputs.is_empty() {
        return TokenStream::from(
            syn::Error::new_spanned(&sig.inputs, "test function must not take arguments")
                .to_compile_error(),
        );
    }

    // Pin the body's type to the declared return type so that `?` in the
    // body has a concrete error type to convert into.
    let body_ty: TokenStream2 = match output {
        ReturnType::Default => quote! { () },
        ReturnType::Type(_, ty) => quote! { #ty },
    };

    let run_body: TokenStream2 = if sig.asyncness.is_some() {
        quote! {
            let test_rt = tokio::runtime::Builder::new_multi_thread()
                .worker_threads(2)
                .enable_all()
                .build()
                .unwrap();
            std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| -> #body_ty {
                test_rt.block_on(async #fn_block)
            }))
        }
    } else {
        quote! {
            std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| -> #body_ty #fn_block))
        }
    };

    let output = quote! {
        #[test]
        #(#fn_attrs)*
        #fn_vis fn #fn_name() #output {
            use std::sync::mpsc::channel;
            use std::sync::mpsc::RecvTimeoutError;
            use std::thread;
            use std::time::Duration;

            let (result_tx, result_rx) = channel();

            // The body runs on its own thread so that the timeout below fires
            // even when the body never yields.
            thread::spawn(move || {
                let result = { #run_body };
                let _ = result_tx.send(result);
            });

            match result_rx.recv_timeout(Duration::from_secs(#timeout_secs)) {
                Ok(result) => match result {
                    Ok(test_result) => test_result,
                    Err(panic) => std::panic::resume_unwind(panic),
                },
                Err(RecvTimeoutError::Timeout) => {
                    panic!("test timed out after {} seconds", #timeout_secs);
                },
                Err(RecvTimeoutError::Disconnected) => {
                    panic!("test thread panicked without sending result");
                }
            }
        }
    };

    output.into()
}

fn parse_timeout(attr: &MetaNameValue) -> Result<u64, syn::Error> {
    if !attr.path.is_ident("timeout_secs") {
        return Err(syn::Error::new_spanned(
            &attr.path,
            "only timeout_secs allowed as argument",
        ));
    }
    let unexpected = || {
        syn::Error::new_spanned(
            &attr.value,
            "unexpected value for timeout_secs, please pass an integer literal",
        )
    };
    match &attr.value {
        Expr::Lit(lit) => match &lit.lit {
            Lit::Int(val) => val.base10_parse::<u64>(),
            _ => Err(unexpected()),
        },
        _ => Err(unexpected()),
    }
}
