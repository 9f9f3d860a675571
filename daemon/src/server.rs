//! gRPC server for daemon control.

use std::pin::Pin;
use std::sync::Arc;
use tokio_stream::wrappers::BroadcastStream;
use tokio_stream::{Stream, StreamExt};
use tonic::{Request, Response, Status};
use tracing::debug;

use dictaflow_proto::dictaflow_server::{Dictaflow, DictaflowServer};
use dictaflow_proto::{Empty, Event, ProviderList, SelectProviderRequest, StatusReply, ToggleRequest};

use crate::controller::Controller;
use crate::error::SessionError;

/// gRPC service implementation.
pub struct DictaflowService {
    controller: Arc<Controller>,
}

impl DictaflowService {
    /// Create a new service with the given controller.
    pub fn new(controller: Arc<Controller>) -> Self {
        Self { controller }
    }

    /// Create the tonic server.
    pub fn into_server(self) -> DictaflowServer<Self> {
        DictaflowServer::new(self)
    }
}

fn to_status(error: SessionError) -> Status {
    let message = error.to_string();
    match error {
        SessionError::UnknownProvider(_) => Status::not_found(message),
        SessionError::ProviderBusy
        | SessionError::ProviderUnavailable(_)
        | SessionError::MissingCredential { .. }
        | SessionError::Credential(_) => Status::failed_precondition(message),
        SessionError::Auth(_) => Status::unauthenticated(message),
        SessionError::Timeout { .. } => Status::deadline_exceeded(message),
        SessionError::Transport(_) => Status::unavailable(message),
        SessionError::Persistence(_) => Status::internal(message),
    }
}

#[tonic::async_trait]
impl Dictaflow for DictaflowService {
    async fn toggle(&self, request: Request<ToggleRequest>) -> Result<Response<Empty>, Status> {
        let with_formatting_override = request.into_inner().with_formatting_override;
        self.controller
            .toggle(with_formatting_override)
            .await
            .map_err(to_status)?;
        Ok(Response::new(Empty {}))
    }

    async fn stop_recording(&self, _request: Request<Empty>) -> Result<Response<Empty>, Status> {
        self.controller.stop_recording().await;
        Ok(Response::new(Empty {}))
    }

    async fn clear_transcript(&self, _request: Request<Empty>) -> Result<Response<Empty>, Status> {
        self.controller.clear_transcript().await.map_err(to_status)?;
        Ok(Response::new(Empty {}))
    }

    async fn get_status(&self, _request: Request<Empty>) -> Result<Response<StatusReply>, Status> {
        Ok(Response::new(self.controller.status()))
    }

    async fn list_providers(
        &self,
        _request: Request<Empty>,
    ) -> Result<Response<ProviderList>, Status> {
        Ok(Response::new(ProviderList {
            providers: self.controller.providers(),
        }))
    }

    async fn select_provider(
        &self,
        request: Request<SelectProviderRequest>,
    ) -> Result<Response<Empty>, Status> {
        let id = request.into_inner().id;
        self.controller.select_provider(&id).await.map_err(to_status)?;
        Ok(Response::new(Empty {}))
    }

    type SubscribeStream = Pin<Box<dyn Stream<Item = Result<Event, Status>> + Send>>;

    async fn subscribe(
        &self,
        _request: Request<Empty>,
    ) -> Result<Response<Self::SubscribeStream>, Status> {
        let mut events = BroadcastStream::new(self.controller.event_sender().subscribe());
        let closing = self.controller.closing();
        let stream = async_stream::stream! {
            loop {
                let item = tokio::select! {
                    _ = closing.cancelled() => break,
                    item = events.next() => item,
                };
                match item {
                    Some(Ok(event)) => yield Ok(event),
                    // Slow subscribers skip missed level frames instead of being dropped
                    Some(Err(e)) => debug!(error = %e, "Subscriber lagged"),
                    None => break,
                }
            }
        };
        Ok(Response::new(Box::pin(stream)))
    }

    async fn shutdown(&self, _request: Request<Empty>) -> Result<Response<Empty>, Status> {
        self.controller.shutdown().await;
        Ok(Response::new(Empty {}))
    }
}

#[cfg(test)]
#[path = "server_test.rs"]
mod tests;
