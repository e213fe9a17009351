/// Builds a closure that can be passed to [`JobRegistry::register`](crate::JobRegistry::register).
///
/// Takes the payload binding, an optional synchronous setup block and the
/// async body. The setup block runs on every call, before the future is
/// created, so it is the place to clone `Arc`s the body needs. The body must
/// evaluate to a [`JobResult`](crate::JobResult).
///
/// # Usage
///
/// ```no_run
/// use turnqueue::{job_fn, JobRegistry};
/// use serde_json::json;
/// use std::sync::atomic::{AtomicUsize, Ordering};
/// use std::sync::Arc;
///
/// let runs = Arc::new(AtomicUsize::new(0));
/// let mut registry = JobRegistry::new();
///
/// // With setup block:
/// registry.register("counter", job_fn! {
///     |payload|
///     {
///         let runs = runs.clone();
///     }
///     {
///         let n = runs.fetch_add(1, Ordering::SeqCst) + 1;
///         Ok(json!({ "run": n, "payload": payload }))
///     }
/// });
///
/// // Without setup block:
/// registry.register("noop", job_fn! {
///     |_payload|
///     {
///         Ok(json!(null))
///     }
/// });
/// ```
#[macro_export]
macro_rules! job_fn {
    // Payload binding, setup block, main block.
    (
        |$payload:pat_param|
        { $($setup_stmts:stmt);* $(;)? }
        $main_block:block
    ) => {
        move |$payload: ::std::option::Option<$crate::Payload>| {
            $($setup_stmts;)*

            let fut = async move { $main_block };

            ::std::boxed::Box::pin(fut)
                as ::std::pin::Pin<::std::boxed::Box<dyn ::std::future::Future<Output = $crate::JobResult> + Send + 'static>>
        }
    };

    // Payload binding and main block only.
    (
        |$payload:pat_param|
        $main_block:block
    ) => {
        move |$payload: ::std::option::Option<$crate::Payload>| {
            let fut = async move { $main_block };

            ::std::boxed::Box::pin(fut)
                as ::std::pin::Pin<::std::boxed::Box<dyn ::std::future::Future<Output = $crate::JobResult> + Send + 'static>>
        }
    };
}
