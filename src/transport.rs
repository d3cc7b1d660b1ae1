//! The transport seam.
//!
//! The engine never speaks a network protocol itself. A [`Transport`] turns a
//! [`Request`] into a [`Response`] and classifies its failures: a
//! [`FetchError::Network`] is retried by the network pool up to the configured
//! limit, every other failure is escalated as fatal.

use crate::error::FetchError;
use crate::request::{Request, Response};
use async_trait::async_trait;
use std::sync::Arc;

/// Performs one fetch attempt.
#[async_trait]
pub trait Transport: Send + Sync + 'static {
    /// Fetches `request`. The request stays with the caller so it can be retried.
    async fn fetch(&self, request: &Request) -> Result<Response, FetchError>;
}

#[async_trait]
impl<T: Transport + ?Sized> Transport for Arc<T> {
    async fn fetch(&self, request: &Request) -> Result<Response, FetchError> {
        (**self).fetch(request).await
    }
}
