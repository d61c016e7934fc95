//! Generic CRUD façade.
//!
//! Feature services (schedules, people, locations, tasks, ...) each hold a
//! [`Resource`] for their path and never touch the store or the network
//! directly. Every call resolves to a server response, a cached value, `None`,
//! or an error; write failures are queued for replay and still reported.

use chrono::Utc;
use serde::{de::DeserializeOwned, Serialize};
use serde_json::{Map, Value};
use sha2::{Digest, Sha256};
use std::collections::BTreeMap;
use std::marker::PhantomData;
use std::sync::RwLock;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::engine::Engine;
use crate::error::{Error, Result};
use crate::remote::{RemoteError, RemoteRequest};
use crate::store::{collection_name, LocalStoreExt};
use crate::transaction::{Method, NewTransaction};

/// API root plus the company the user is currently working in.
#[derive(Debug)]
pub struct ClientState {
  api_url: String,
  company: RwLock<Option<String>>,
}

impl ClientState {
  pub fn new(api_url: &str, company: Option<String>) -> Self {
    Self {
      api_url: api_url.trim_end_matches('/').to_string(),
      company: RwLock::new(company),
    }
  }

  pub fn api_url(&self) -> &str {
    &self.api_url
  }

  pub fn company(&self) -> Result<Option<String>> {
    Ok(self.company.read()?.clone())
  }

  pub fn set_company(&self, company: Option<String>) -> Result<()> {
    *self.company.write()? = company;
    Ok(())
  }

  /// `{api_url}/companies/{company}{path}`
  pub fn endpoint(&self, path: &str) -> Result<String> {
    let company = self.company()?.ok_or(Error::NoActiveCompany)?;
    Ok(format!("{}/companies/{}{}", self.api_url, company, path))
  }
}

/// Filter parameters for a list read. The cache key is derived from the
/// normalised parameters and the active company, so identical queries share
/// one cached snapshot regardless of parameter order.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ListQuery {
  params: BTreeMap<String, String>,
}

impl ListQuery {
  pub fn new() -> Self {
    Self::default()
  }

  pub fn param(mut self, key: impl Into<String>, value: impl ToString) -> Self {
    let key = key.into().trim().to_string();
    self.params.insert(key, value.to_string().trim().to_string());
    self
  }

  pub fn params(&self) -> Vec<(String, String)> {
    self
      .params
      .iter()
      .map(|(k, v)| (k.clone(), v.clone()))
      .collect()
  }

  pub fn cache_key(&self, company: &str) -> Result<String> {
    // JSON keeps every key and value delimited, so distinct queries never
    // share an input.
    let encoded = serde_json::to_vec(&(company, &self.params))?;
    let mut hasher = Sha256::new();
    hasher.update(&encoded);
    Ok(format!("list:{}", hex::encode(hasher.finalize())))
  }
}

/// Identity carried by `value` under `field`, as a cache key and as the raw JSON value.
pub(crate) fn entity_identity(value: &Value, field: &str) -> Option<(String, Value)> {
  let id = value.get(field)?;
  let key = match id {
    Value::String(s) if !s.is_empty() => s.clone(),
    Value::Number(n) => n.to_string(),
    _ => return None,
  };
  Some((key, id.clone()))
}

/// Cache key form of a server identity.
pub(crate) fn identity_key(id: &Value) -> String {
  match id {
    Value::String(s) => s.clone(),
    other => other.to_string(),
  }
}

/// Replace top-level fields holding the client key with the server identity.
pub(crate) fn substitute_identity(body: Value, client_key: &str, server_id: &Value) -> Value {
  match body {
    Value::Object(map) => Value::Object(
      map
        .into_iter()
        .map(|(k, v)| match &v {
          Value::String(s) if s == client_key => (k, server_id.clone()),
          _ => (k, v),
        })
        .collect(),
    ),
    other => other,
  }
}

fn to_object<T: Serialize>(entity: &T) -> Result<Map<String, Value>> {
  match serde_json::to_value(entity)? {
    Value::Object(map) => Ok(map),
    _ => Err(Error::NotAnObject),
  }
}

/// Network-first CRUD over one REST resource, with cache fallback and
/// queued writes.
pub struct Resource<T> {
  engine: Engine,
  path: String,
  collection: String,
  id_field: String,
  _entity: PhantomData<fn() -> T>,
}

impl<T> Clone for Resource<T> {
  fn clone(&self) -> Self {
    Self {
      engine: self.engine.clone(),
      path: self.path.clone(),
      collection: self.collection.clone(),
      id_field: self.id_field.clone(),
      _entity: PhantomData,
    }
  }
}

impl<T> Resource<T>
where
  T: Serialize + DeserializeOwned,
{
  /// `path` is the resource path below the company (e.g. `/people`);
  /// `id_field` names the server-assigned identity in responses (e.g. `personId`).
  pub fn new(engine: Engine, path: &str, id_field: &str) -> Result<Self> {
    let path = format!("/{}", path.trim_matches('/'));
    Ok(Self {
      collection: collection_name(&path)?,
      engine,
      path,
      id_field: id_field.to_string(),
      _entity: PhantomData,
    })
  }

  pub fn collection(&self) -> &str {
    &self.collection
  }

  fn collection_endpoint(&self) -> Result<String> {
    self.engine.client().endpoint(&self.path)
  }

  fn item_endpoint(&self, id: &str) -> Result<String> {
    self.engine.client().endpoint(&format!("{}/{}", self.path, id))
  }

  /// Swap a client id whose create has already replayed for the server
  /// identity, rewriting `body` to match.
  fn resolve(&self, id: &str, body: Option<Value>) -> Result<(String, Option<Value>)> {
    match self.engine.store().resolved_identity(&self.collection, id)? {
      Some(server_id) => {
        debug!(collection = %self.collection, id, server_id = %server_id, "using server identity");
        let body = body.map(|b| substitute_identity(b, id, &server_id));
        Ok((identity_key(&server_id), body))
      }
      None => Ok((id.to_string(), body)),
    }
  }

  fn queue(&self, tx: NewTransaction) -> Result<i64> {
    self.engine.store().enqueue(tx)
  }

  /// Queue `tx` after a failed network attempt, then hand back the original error.
  fn queue_failure<R>(&self, tx: NewTransaction, e: RemoteError) -> Result<R> {
    warn!(collection = %self.collection, method = %tx.method, error = %e, "network write failed, queued for replay");
    let tx = tx.failed_with(e.class(), e.to_string(), self.engine.options().quarantine_permanent);
    self.queue(tx)?;
    Err(e.into())
  }

  /// Mirror a server response under `key`.
  fn mirror(&self, key: &str, value: &Value) -> Result<()> {
    self.engine.store().put_value(&self.collection, key, value)
  }

  fn audit(&self, key: &str, endpoint: &str, value: &Value) -> Result<()> {
    if self.engine.options().audit_reads {
      self.queue(
        NewTransaction::new(&self.collection, Method::Get, endpoint)
          .key(key)
          .data(value.clone()),
      )?;
    }
    Ok(())
  }

  /// Create an entity. A client identifier (`id`) and `createdAt` are stamped
  /// on the payload first. Offline, the stamped entity is queued and
  /// returned as-is.
  pub async fn create(&self, entity: &T) -> Result<T> {
    let client_id = Uuid::new_v4().to_string();
    let mut body = to_object(entity)?;
    body.insert("id".into(), Value::String(client_id.clone()));
    body.insert("createdAt".into(), Value::String(Utc::now().to_rfc3339()));
    let body = Value::Object(body);

    let endpoint = self.collection_endpoint()?;
    let queued = NewTransaction::new(&self.collection, Method::Post, &endpoint)
      .key(&client_id)
      .data(body.clone())
      .payload(body.clone())
      .id_field(&self.id_field)
      .pending_identity();

    if !self.engine.connectivity().is_online() {
      self.queue(queued)?;
      return Ok(serde_json::from_value(body)?);
    }

    let request = RemoteRequest::new(Method::Post, &endpoint).with_body(Some(body.clone()));
    match self.engine.remote().send(request).await {
      Ok(response) => {
        let value = response.unwrap_or(body);
        let key = entity_identity(&value, &self.id_field)
          .map(|(key, _)| key)
          .unwrap_or(client_id);
        self.mirror(&key, &value)?;
        Ok(serde_json::from_value(value)?)
      }
      Err(e) => self.queue_failure(queued, e),
    }
  }

  /// Replace an entity. The queued entry carries the full replacement.
  pub async fn update(&self, id: &str, entity: &T) -> Result<T> {
    let mut body = to_object(entity)?;
    body.insert("editedAt".into(), Value::String(Utc::now().to_rfc3339()));
    let body = Value::Object(body);

    // The entity only exists locally until its create replays.
    if let Some(parent) = self.engine.store().pending_create(&self.collection, id)? {
      debug!(collection = %self.collection, id, parent, "update waits for queued create");
      let queued = self.put_transaction(id, &body)?.depends_on(Some(parent));
      self.queue(queued)?;
      return Ok(serde_json::from_value(body)?);
    }

    let (id, body) = self.resolve(id, Some(body))?;
    let body = body.unwrap_or_default();
    let id = id.as_str();
    let endpoint = self.item_endpoint(id)?;
    let queued = self.put_transaction(id, &body)?;

    if !self.engine.connectivity().is_online() {
      self.queue(queued)?;
      return Ok(serde_json::from_value(body)?);
    }

    let request = RemoteRequest::new(Method::Put, &endpoint).with_body(Some(body.clone()));
    match self.engine.remote().send(request).await {
      Ok(response) => {
        let value = response.unwrap_or(body);
        self.mirror(id, &value)?;
        Ok(serde_json::from_value(value)?)
      }
      Err(e) => self.queue_failure(queued, e),
    }
  }

  fn put_transaction(&self, id: &str, body: &Value) -> Result<NewTransaction> {
    Ok(
      NewTransaction::new(&self.collection, Method::Put, &self.item_endpoint(id)?)
        .key(id)
        .data(body.clone())
        .payload(body.clone())
        .id_field(&self.id_field),
    )
  }

  fn delete_transaction(&self, id: &str) -> Result<NewTransaction> {
    Ok(
      NewTransaction::new(&self.collection, Method::Delete, &self.item_endpoint(id)?)
        .key(id)
        .id_field(&self.id_field),
    )
  }

  /// Delete an entity. Queued deletes remove the cached record immediately.
  pub async fn delete(&self, id: &str) -> Result<()> {
    let store = self.engine.store();

    if let Some(parent) = store.pending_create(&self.collection, id)? {
      debug!(collection = %self.collection, id, parent, "delete waits for queued create");
      self.queue(self.delete_transaction(id)?.depends_on(Some(parent)))?;
      return store.delete(&self.collection, id);
    }

    let (id, _) = self.resolve(id, None)?;
    let id = id.as_str();
    let endpoint = self.item_endpoint(id)?;
    let queued = self.delete_transaction(id)?;

    if !self.engine.connectivity().is_online() {
      self.queue(queued)?;
      return store.delete(&self.collection, id);
    }

    match self
      .engine
      .remote()
      .send(RemoteRequest::new(Method::Delete, &endpoint))
      .await
    {
      Ok(_) => store.delete(&self.collection, id),
      Err(e) => {
        store.delete(&self.collection, id)?;
        self.queue_failure(queued, e)
      }
    }
  }

  /// Read one entity, falling back to the cache when the network fails.
  ///
  /// With no cached copy, an unreachable server resolves to `None` like an
  /// offline read; an error status from a reachable server is returned.
  pub async fn get(&self, id: &str) -> Result<Option<T>> {
    let store = self.engine.store();
    let (id, _) = self.resolve(id, None)?;
    let id = id.as_str();
    if !self.engine.connectivity().is_online() {
      return store.get(&self.collection, id);
    }

    let endpoint = self.item_endpoint(id)?;
    match self
      .engine
      .remote()
      .send(RemoteRequest::new(Method::Get, &endpoint))
      .await
    {
      Ok(Some(value)) => {
        self.mirror(id, &value)?;
        self.audit(id, &endpoint, &value)?;
        Ok(Some(serde_json::from_value(value)?))
      }
      Ok(None) => Ok(None),
      Err(e) => {
        let cached = store.get(&self.collection, id)?;
        warn!(collection = %self.collection, id, error = %e, hit = cached.is_some(), "read failed, using cache");
        match cached {
          Some(entity) => Ok(Some(entity)),
          None if e.is_transport() => Ok(None),
          None => Err(e.into()),
        }
      }
    }
  }

  /// Read a list snapshot. Same fallback rules as [`Resource::get`], keyed by
  /// the query's cache key.
  pub async fn get_all(&self, query: &ListQuery) -> Result<Option<Vec<T>>> {
    let company = self
      .engine
      .client()
      .company()?
      .ok_or(Error::NoActiveCompany)?;
    let key = query.cache_key(&company)?;
    let store = self.engine.store();

    if !self.engine.connectivity().is_online() {
      return store.get(&self.collection, &key);
    }

    let endpoint = self.collection_endpoint()?;
    let request = RemoteRequest::new(Method::Get, &endpoint).with_query(query.params());
    match self.engine.remote().send(request).await {
      Ok(response) => {
        let value = response.unwrap_or_else(|| Value::Array(Vec::new()));
        self.mirror(&key, &value)?;
        self.audit(&key, &endpoint, &value)?;
        Ok(Some(serde_json::from_value(value)?))
      }
      Err(e) => {
        let cached = store.get(&self.collection, &key)?;
        warn!(collection = %self.collection, error = %e, hit = cached.is_some(), "list read failed, using cache");
        match cached {
          Some(list) => Ok(Some(list)),
          None if e.is_transport() => Ok(None),
          None => Err(e.into()),
        }
      }
    }
  }
}
