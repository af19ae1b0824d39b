use std::future::Future;
use std::marker::PhantomData;

use async_trait::async_trait;
use serde_json::Value;

pub use crate::error::HandlerError;

/// Execution details passed to a handler alongside the payload.
#[derive(Debug, Clone)]
pub struct JobContext {
    pub job_id: String,
    pub job_type: String,
    /// 1-based attempt number of this execution.
    pub attempt: u32,
    pub max_attempts: u32,
    pub video_id: Option<i64>,
}

impl JobContext {
    pub fn is_final_attempt(&self) -> bool {
        self.attempt >= self.max_attempts
    }
}

/// Work executed for one job type.
///
/// Returning `Ok` completes the job with the value as its result; `Err`
/// counts as a failed attempt.
#[async_trait]
pub trait JobHandler: Send + Sync + 'static {
    async fn handle(&self, payload: Value, ctx: JobContext) -> Result<Value, HandlerError>;
}

/// Adapts an async closure into a [`JobHandler`].
pub struct FnHandler<F, Fut> {
    f: F,
    _fut: PhantomData<fn() -> Fut>,
}

/// Wraps `f` so it can be registered with the scheduler.
pub fn handler_fn<F, Fut>(f: F) -> FnHandler<F, Fut>
where
    F: Fn(Value, JobContext) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<Value, HandlerError>> + Send + 'static,
{
    FnHandler {
        f,
        _fut: PhantomData,
    }
}

#[async_trait]
impl<F, Fut> JobHandler for FnHandler<F, Fut>
where
    F: Fn(Value, JobContext) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<Value, HandlerError>> + Send + 'static,
{
    async fn handle(&self, payload: Value, ctx: JobContext) -> Result<Value, HandlerError> {
        (self.f)(payload, ctx).await
    }
}
