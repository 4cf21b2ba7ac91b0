//! Store y cola del master, vistos desde el worker por HTTP.
//!
//! Implementan los mismos traits que el master usa en proceso, así las
//! etapas no saben si corren local o remoto.

use async_trait::async_trait;
use common::queue::Dispatcher;
use common::run::ErrorResponse;
use common::store::{SharedStore, StoreCommand, StoreReply};
use common::{DispatchResponse, Error, Result, TaskEnvelope, TaskId};
use reqwest::{Client, Response, StatusCode};
use tracing::debug;

/// Arma el error de un comando que el master rechazó.
fn rejected_command(name: &str, key: Option<&str>, status: StatusCode, detail: &str) -> Error {
    if status == StatusCode::CONFLICT {
        return Error::WrongType {
            key: key.unwrap_or_default().to_string(),
        };
    }
    Error::store(format!("{name}: master respondió {status}: {detail}"))
}

async fn error_detail(resp: Response) -> String {
    resp.json::<ErrorResponse>()
        .await
        .map(|e| e.error)
        .unwrap_or_default()
}

pub struct HttpStore {
    client: Client,
    url: String,
}

impl HttpStore {
    pub fn new(client: Client, base_url: &str) -> Self {
        Self {
            client,
            url: format!("{}/api/v1/store", base_url.trim_end_matches('/')),
        }
    }
}

#[async_trait]
impl SharedStore for HttpStore {
    async fn execute(&self, command: StoreCommand) -> Result<StoreReply> {
        let name = command.name();
        let key = command.key().map(str::to_string);
        debug!("{} {:?} -> {}", name, key, self.url);

        let resp = self
            .client
            .post(&self.url)
            .json(&command)
            .send()
            .await
            .map_err(|e| Error::store_with_source(format!("{name} no llegó al master"), e))?;

        let status = resp.status();
        if !status.is_success() {
            let detail = error_detail(resp).await;
            return Err(rejected_command(name, key.as_deref(), status, &detail));
        }
        resp.json::<StoreReply>()
            .await
            .map_err(|e| Error::store_with_source(format!("respuesta inválida a {name}"), e))
    }
}

pub struct HttpDispatcher {
    client: Client,
    url: String,
}

impl HttpDispatcher {
    pub fn new(client: Client, base_url: &str) -> Self {
        Self {
            client,
            url: format!("{}/api/v1/tasks", base_url.trim_end_matches('/')),
        }
    }
}

#[async_trait]
impl Dispatcher for HttpDispatcher {
    async fn dispatch(&self, envelope: TaskEnvelope) -> Result<TaskId> {
        let kind = envelope.kind();
        let failed = |message: String| Error::Dispatch { message };

        let resp = self
            .client
            .post(&self.url)
            .json(&envelope)
            .send()
            .await
            .map_err(|e| failed(format!("{kind}: {e}")))?;

        let status = resp.status();
        if !status.is_success() {
            let detail = error_detail(resp).await;
            return Err(failed(format!("{kind}: master respondió {status}: {detail}")));
        }
        let DispatchResponse { task_id } = resp
            .json()
            .await
            .map_err(|e| failed(format!("{kind}: respuesta inválida: {e}")))?;
        Ok(task_id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn conflict_becomes_wrong_type() {
        let err = rejected_command("HLEN", Some("k"), StatusCode::CONFLICT, "wrong type for key k");
        assert!(matches!(err, Error::WrongType { key } if key == "k"));
    }

    #[test]
    fn other_rejections_are_transient_store_errors() {
        let err = rejected_command("GET", Some("k"), StatusCode::SERVICE_UNAVAILABLE, "");
        assert!(err.is_transient());
        assert!(err.to_string().contains("503"));
    }

    #[test]
    fn urls_ignore_trailing_slash() {
        let store = HttpStore::new(Client::new(), "http://master:8080/");
        assert_eq!(store.url, "http://master:8080/api/v1/store");
        let dispatcher = HttpDispatcher::new(Client::new(), "http://master:8080");
        assert_eq!(dispatcher.url, "http://master:8080/api/v1/tasks");
    }
}
