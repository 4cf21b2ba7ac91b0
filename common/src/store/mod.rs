//! Store compartido de coordinación.
//!
//! Es el único estado mutable compartido entre workers. Todo pasa por
//! primitivas atómicas: set-if-absent, decremento atómico, operaciones de
//! hash, expiración y scan. Cada comando es atómico por sí mismo; no hay
//! transacciones entre comandos.
//!
//! [`StoreCommand`] / [`StoreReply`] son además el protocolo que el master
//! expone en `POST /api/v1/store`, así el worker usa el mismo trait por HTTP.

pub mod memory;

use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

pub use memory::MemoryStore;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum StoreCommand {
    Get { key: String },
    Set { key: String, value: String },
    SetNx { key: String, value: String },
    Delete { key: String },
    Exists { key: String },
    Expire { key: String, seconds: u64 },
    Ttl { key: String },
    HSet { key: String, field: String, value: String },
    HGet { key: String, field: String },
    HVals { key: String },
    HGetAll { key: String },
    HLen { key: String },
    Scan { pattern: String },
    Decr { key: String },
}

impl StoreCommand {
    /// Nombre corto del comando, para logs.
    pub fn name(&self) -> &'static str {
        match self {
            Self::Get { .. } => "GET",
            Self::Set { .. } => "SET",
            Self::SetNx { .. } => "SETNX",
            Self::Delete { .. } => "DEL",
            Self::Exists { .. } => "EXISTS",
            Self::Expire { .. } => "EXPIRE",
            Self::Ttl { .. } => "TTL",
            Self::HSet { .. } => "HSET",
            Self::HGet { .. } => "HGET",
            Self::HVals { .. } => "HVALS",
            Self::HGetAll { .. } => "HGETALL",
            Self::HLen { .. } => "HLEN",
            Self::Scan { .. } => "SCAN",
            Self::Decr { .. } => "DECR",
        }
    }

    /// Clave sobre la que opera el comando (`None` para SCAN).
    pub fn key(&self) -> Option<&str> {
        match self {
            Self::Get { key }
            | Self::Set { key, .. }
            | Self::SetNx { key, .. }
            | Self::Delete { key }
            | Self::Exists { key }
            | Self::Expire { key, .. }
            | Self::Ttl { key }
            | Self::HSet { key, .. }
            | Self::HGet { key, .. }
            | Self::HVals { key }
            | Self::HGetAll { key }
            | Self::HLen { key }
            | Self::Decr { key } => Some(key),
            Self::Scan { .. } => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", content = "value", rename_all = "snake_case")]
pub enum StoreReply {
    Nil,
    Ok,
    Bool(bool),
    Int(i64),
    Value(String),
    Values(Vec<String>),
    Pairs(Vec<(String, String)>),
}

fn unexpected(cmd: &str, reply: StoreReply) -> Error {
    Error::store(format!("unexpected reply to {cmd}: {reply:?}"))
}

/// Acceso al store compartido.
///
/// Las implementaciones sólo tienen que ejecutar [`StoreCommand`]s; los
/// métodos tipados de abajo traducen las respuestas.
#[async_trait]
pub trait SharedStore: Send + Sync {
    async fn execute(&self, command: StoreCommand) -> Result<StoreReply>;

    async fn get(&self, key: &str) -> Result<Option<String>> {
        match self.execute(StoreCommand::Get { key: key.into() }).await? {
            StoreReply::Nil => Ok(None),
            StoreReply::Value(v) => Ok(Some(v)),
            other => Err(unexpected("GET", other)),
        }
    }

    async fn set(&self, key: &str, value: &str) -> Result<()> {
        let cmd = StoreCommand::Set {
            key: key.into(),
            value: value.into(),
        };
        match self.execute(cmd).await? {
            StoreReply::Ok => Ok(()),
            other => Err(unexpected("SET", other)),
        }
    }

    /// Devuelve true si la clave no existía y se escribió.
    async fn set_nx(&self, key: &str, value: &str) -> Result<bool> {
        let cmd = StoreCommand::SetNx {
            key: key.into(),
            value: value.into(),
        };
        match self.execute(cmd).await? {
            StoreReply::Bool(b) => Ok(b),
            other => Err(unexpected("SETNX", other)),
        }
    }

    /// Cantidad de claves efectivamente borradas (0 o 1).
    async fn delete(&self, key: &str) -> Result<u64> {
        match self.execute(StoreCommand::Delete { key: key.into() }).await? {
            StoreReply::Int(n) => Ok(n.max(0) as u64),
            other => Err(unexpected("DEL", other)),
        }
    }

    async fn exists(&self, key: &str) -> Result<bool> {
        match self.execute(StoreCommand::Exists { key: key.into() }).await? {
            StoreReply::Bool(b) => Ok(b),
            other => Err(unexpected("EXISTS", other)),
        }
    }

    /// false si la clave no existe.
    async fn expire(&self, key: &str, ttl: Duration) -> Result<bool> {
        let cmd = StoreCommand::Expire {
            key: key.into(),
            seconds: ttl.as_secs(),
        };
        match self.execute(cmd).await? {
            StoreReply::Bool(b) => Ok(b),
            other => Err(unexpected("EXPIRE", other)),
        }
    }

    /// Tiempo de vida restante; None si la clave no existe o no expira.
    async fn ttl(&self, key: &str) -> Result<Option<Duration>> {
        match self.execute(StoreCommand::Ttl { key: key.into() }).await? {
            StoreReply::Nil => Ok(None),
            StoreReply::Int(secs) => Ok(Some(Duration::from_secs(secs.max(0) as u64))),
            other => Err(unexpected("TTL", other)),
        }
    }

    /// true si el campo es nuevo en el hash.
    async fn hset(&self, key: &str, field: &str, value: &str) -> Result<bool> {
        let cmd = StoreCommand::HSet {
            key: key.into(),
            field: field.into(),
            value: value.into(),
        };
        match self.execute(cmd).await? {
            StoreReply::Bool(b) => Ok(b),
            other => Err(unexpected("HSET", other)),
        }
    }

    async fn hget(&self, key: &str, field: &str) -> Result<Option<String>> {
        let cmd = StoreCommand::HGet {
            key: key.into(),
            field: field.into(),
        };
        match self.execute(cmd).await? {
            StoreReply::Nil => Ok(None),
            StoreReply::Value(v) => Ok(Some(v)),
            other => Err(unexpected("HGET", other)),
        }
    }

    async fn hvals(&self, key: &str) -> Result<Vec<String>> {
        match self.execute(StoreCommand::HVals { key: key.into() }).await? {
            StoreReply::Values(v) => Ok(v),
            other => Err(unexpected("HVALS", other)),
        }
    }

    /// Pares (campo, valor) ordenados por campo.
    async fn hgetall(&self, key: &str) -> Result<Vec<(String, String)>> {
        match self.execute(StoreCommand::HGetAll { key: key.into() }).await? {
            StoreReply::Pairs(p) => Ok(p),
            other => Err(unexpected("HGETALL", other)),
        }
    }

    async fn hlen(&self, key: &str) -> Result<u64> {
        match self.execute(StoreCommand::HLen { key: key.into() }).await? {
            StoreReply::Int(n) => Ok(n.max(0) as u64),
            other => Err(unexpected("HLEN", other)),
        }
    }

    /// Claves vivas que matchean el patrón glob.
    async fn scan(&self, pattern: &str) -> Result<Vec<String>> {
        let cmd = StoreCommand::Scan {
            pattern: pattern.into(),
        };
        match self.execute(cmd).await? {
            StoreReply::Values(v) => Ok(v),
            other => Err(unexpected("SCAN", other)),
        }
    }

    /// Decremento atómico; devuelve el valor después de decrementar.
    async fn decr(&self, key: &str) -> Result<i64> {
        match self.execute(StoreCommand::Decr { key: key.into() }).await? {
            StoreReply::Int(n) => Ok(n),
            other => Err(unexpected("DECR", other)),
        }
    }
}
