//! Store en memoria.
//!
//! Lo usa el master como store del cluster (lo expone por HTTP) y los tests
//! directamente. Todos los comandos corren bajo un único lock, así que cada
//! comando es atómico respecto de los demás. Las claves vencidas se borran
//! de forma perezosa al tocarlas.

use std::collections::{BTreeMap, HashMap};
use std::sync::{Mutex, PoisonError};
use std::time::{Duration, Instant};

use async_trait::async_trait;

use super::{SharedStore, StoreCommand, StoreReply};
use crate::error::{Error, Result};

#[derive(Debug, Clone)]
enum Value {
    Str(String),
    Hash(BTreeMap<String, String>),
}

#[derive(Debug, Clone)]
struct Entry {
    value: Value,
    expires_at: Option<Instant>,
}

impl Entry {
    fn new(value: Value) -> Self {
        Self {
            value,
            expires_at: None,
        }
    }

    fn is_expired(&self, now: Instant) -> bool {
        self.expires_at.is_some_and(|at| at <= now)
    }
}

#[derive(Debug, Default)]
pub struct MemoryStore {
    entries: Mutex<HashMap<String, Entry>>,
}

fn poison_err<T>(_: PoisonError<T>) -> Error {
    Error::store("memory store lock poisoned")
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Cantidad de claves vivas.
    pub fn len(&self) -> Result<usize> {
        let mut entries = self.entries.lock().map_err(poison_err)?;
        let now = Instant::now();
        entries.retain(|_, e| !e.is_expired(now));
        Ok(entries.len())
    }

    pub fn is_empty(&self) -> Result<bool> {
        Ok(self.len()? == 0)
    }

    /// Ejecuta un comando de forma atómica.
    pub fn apply(&self, command: StoreCommand) -> Result<StoreReply> {
        let mut entries = self.entries.lock().map_err(poison_err)?;
        let now = Instant::now();

        // limpieza perezosa de la clave que toca el comando
        if let Some(key) = command.key() {
            if entries.get(key).is_some_and(|e| e.is_expired(now)) {
                entries.remove(key);
            }
        }

        let reply = match command {
            StoreCommand::Get { key } => match entries.get(&key) {
                None => StoreReply::Nil,
                Some(Entry {
                    value: Value::Str(s),
                    ..
                }) => StoreReply::Value(s.clone()),
                Some(_) => return Err(Error::WrongType { key }),
            },

            StoreCommand::Set { key, value } => {
                entries.insert(key, Entry::new(Value::Str(value)));
                StoreReply::Ok
            }

            StoreCommand::SetNx { key, value } => {
                if entries.contains_key(&key) {
                    StoreReply::Bool(false)
                } else {
                    entries.insert(key, Entry::new(Value::Str(value)));
                    StoreReply::Bool(true)
                }
            }

            StoreCommand::Delete { key } => {
                StoreReply::Int(i64::from(entries.remove(&key).is_some()))
            }

            StoreCommand::Exists { key } => StoreReply::Bool(entries.contains_key(&key)),

            StoreCommand::Expire { key, seconds } => {
                if seconds == 0 {
                    StoreReply::Bool(entries.remove(&key).is_some())
                } else {
                    match entries.get_mut(&key) {
                        Some(entry) => {
                            entry.expires_at = Some(now + Duration::from_secs(seconds));
                            StoreReply::Bool(true)
                        }
                        None => StoreReply::Bool(false),
                    }
                }
            }

            StoreCommand::Ttl { key } => match entries.get(&key).and_then(|e| e.expires_at) {
                Some(at) => StoreReply::Int(at.saturating_duration_since(now).as_secs() as i64),
                None => StoreReply::Nil,
            },

            StoreCommand::HSet { key, field, value } => {
                let entry = entries
                    .entry(key.clone())
                    .or_insert_with(|| Entry::new(Value::Hash(BTreeMap::new())));
                match &mut entry.value {
                    Value::Hash(map) => StoreReply::Bool(map.insert(field, value).is_none()),
                    Value::Str(_) => return Err(Error::WrongType { key }),
                }
            }

            StoreCommand::HGet { key, field } => match entries.get(&key) {
                None => StoreReply::Nil,
                Some(Entry {
                    value: Value::Hash(map),
                    ..
                }) => map
                    .get(&field)
                    .map_or(StoreReply::Nil, |v| StoreReply::Value(v.clone())),
                Some(_) => return Err(Error::WrongType { key }),
            },

            StoreCommand::HVals { key } => match entries.get(&key) {
                None => StoreReply::Values(Vec::new()),
                Some(Entry {
                    value: Value::Hash(map),
                    ..
                }) => StoreReply::Values(map.values().cloned().collect()),
                Some(_) => return Err(Error::WrongType { key }),
            },

            StoreCommand::HGetAll { key } => match entries.get(&key) {
                None => StoreReply::Pairs(Vec::new()),
                Some(Entry {
                    value: Value::Hash(map),
                    ..
                }) => StoreReply::Pairs(
                    map.iter().map(|(f, v)| (f.clone(), v.clone())).collect(),
                ),
                Some(_) => return Err(Error::WrongType { key }),
            },

            StoreCommand::HLen { key } => match entries.get(&key) {
                None => StoreReply::Int(0),
                Some(Entry {
                    value: Value::Hash(map),
                    ..
                }) => StoreReply::Int(map.len() as i64),
                Some(_) => return Err(Error::WrongType { key }),
            },

            StoreCommand::Scan { pattern } => {
                let matcher = glob::Pattern::new(&pattern)
                    .map_err(|e| Error::store(format!("invalid scan pattern {pattern}: {e}")))?;
                entries.retain(|_, e| !e.is_expired(now));
                let mut keys: Vec<String> = entries
                    .keys()
                    .filter(|k| matcher.matches(k))
                    .cloned()
                    .collect();
                keys.sort();
                StoreReply::Values(keys)
            }

            StoreCommand::Decr { key } => {
                let entry = entries
                    .entry(key.clone())
                    .or_insert_with(|| Entry::new(Value::Str("0".to_string())));
                let Value::Str(raw) = &mut entry.value else {
                    return Err(Error::WrongType { key });
                };
                let current: i64 = raw.parse().map_err(|_| Error::WrongType { key: key.clone() })?;
                let next = current
                    .checked_sub(1)
                    .ok_or_else(|| Error::OutOfRange { key: key.clone() })?;
                *raw = next.to_string();
                StoreReply::Int(next)
            }
        };

        Ok(reply)
    }
}

#[async_trait]
impl SharedStore for MemoryStore {
    async fn execute(&self, command: StoreCommand) -> Result<StoreReply> {
        self.apply(command)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn set_nx_does_not_overwrite() -> Result<()> {
        let store = MemoryStore::new();

        assert!(store.set_nx("pending_tracks:r1", "4").await?);
        assert!(!store.set_nx("pending_tracks:r1", "9").await?);
        assert_eq!(store.get("pending_tracks:r1").await?.as_deref(), Some("4"));
        Ok(())
    }

    #[tokio::test]
    async fn delete_reports_whether_key_existed() -> Result<()> {
        let store = MemoryStore::new();
        store.hset("masks:r1:A1", "1", "/m/A1_mask_1.tif").await?;

        assert_eq!(store.delete("masks:r1:A1").await?, 1);
        assert_eq!(store.delete("masks:r1:A1").await?, 0);
        Ok(())
    }

    #[tokio::test]
    async fn decr_creates_missing_key_at_minus_one() -> Result<()> {
        let store = MemoryStore::new();
        assert_eq!(store.decr("pending_tracks:nope").await?, -1);

        store.set("pending_tracks:r1", "2").await?;
        assert_eq!(store.decr("pending_tracks:r1").await?, 1);
        assert_eq!(store.decr("pending_tracks:r1").await?, 0);
        Ok(())
    }

    #[tokio::test]
    async fn decr_on_non_integer_is_wrong_type() {
        let store = MemoryStore::new();
        store.set("k", "abc").await.unwrap();
        assert!(matches!(store.decr("k").await, Err(Error::WrongType { .. })));
    }

    #[tokio::test]
    async fn decr_below_i64_min_fails_and_keeps_value() -> Result<()> {
        let store = MemoryStore::new();
        let floor = i64::MIN.to_string();
        store.set("pending_tracks:r1", &floor).await?;

        assert!(matches!(
            store.decr("pending_tracks:r1").await,
            Err(Error::OutOfRange { .. })
        ));
        // el store sigue usable y el valor no cambió
        assert_eq!(store.get("pending_tracks:r1").await?, Some(floor));
        assert_eq!(store.decr("other").await?, -1);
        Ok(())
    }

    #[tokio::test]
    async fn hash_commands_track_fields() -> Result<()> {
        let store = MemoryStore::new();
        assert!(store.hset("masks:r1:A1", "2", "/m/t2.tif").await?);
        assert!(store.hset("masks:r1:A1", "1", "/m/t1.tif").await?);
        // sobrescribir un campo no es campo nuevo
        assert!(!store.hset("masks:r1:A1", "1", "/m/t1.tif").await?);

        assert_eq!(store.hlen("masks:r1:A1").await?, 2);
        assert_eq!(store.hget("masks:r1:A1", "2").await?.as_deref(), Some("/m/t2.tif"));
        assert_eq!(store.hvals("masks:r1:A1").await?, vec!["/m/t1.tif", "/m/t2.tif"]);
        assert_eq!(
            store.hgetall("masks:r1:A1").await?,
            vec![
                ("1".to_string(), "/m/t1.tif".to_string()),
                ("2".to_string(), "/m/t2.tif".to_string()),
            ]
        );
        assert_eq!(store.hlen("masks:r1:missing").await?, 0);
        Ok(())
    }

    #[tokio::test]
    async fn hash_and_string_types_do_not_mix() {
        let store = MemoryStore::new();
        store.set("finished:r1", "1").await.unwrap();
        assert!(matches!(
            store.hset("finished:r1", "1", "x").await,
            Err(Error::WrongType { .. })
        ));

        store.hset("masks:r1:A1", "1", "x").await.unwrap();
        assert!(matches!(store.get("masks:r1:A1").await, Err(Error::WrongType { .. })));
    }

    #[tokio::test]
    async fn expire_sets_ttl_and_zero_deletes() -> Result<()> {
        let store = MemoryStore::new();
        store.set("finished:r1", "1").await?;

        assert!(store.expire("finished:r1", Duration::from_secs(3600)).await?);
        let ttl = store.ttl("finished:r1").await?.unwrap();
        assert!(ttl > Duration::from_secs(3590) && ttl <= Duration::from_secs(3600));

        assert!(!store.expire("missing", Duration::from_secs(10)).await?);

        assert!(store.expire("finished:r1", Duration::ZERO).await?);
        assert!(!store.exists("finished:r1").await?);
        Ok(())
    }

    #[tokio::test]
    async fn expired_keys_disappear() -> Result<()> {
        let store = MemoryStore::new();
        store.set("k", "v").await?;
        {
            let mut entries = store.entries.lock().unwrap();
            entries.get_mut("k").unwrap().expires_at = Some(Instant::now());
        }
        assert!(!store.exists("k").await?);
        assert!(store.is_empty()?);
        Ok(())
    }

    #[tokio::test]
    async fn scan_matches_glob() -> Result<()> {
        let store = MemoryStore::new();
        store.hset("masks:r1:A1", "1", "a").await?;
        store.hset("masks:r1:B2", "1", "b").await?;
        store.hset("masks:r10:A1", "1", "c").await?;
        store.set("pending_tracks:r1", "2").await?;

        let keys = store.scan("masks:r1:*").await?;
        assert_eq!(keys, vec!["masks:r1:A1", "masks:r1:B2"]);
        Ok(())
    }
}
