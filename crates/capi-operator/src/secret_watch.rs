//! Secret-change propagator
//!
//! Watches Secrets and stamps the SHA-256 of a referenced Secret's data onto
//! every provider whose `configSecret` points at it. The annotation change
//! bumps the provider object, so the provider's own controller reconciles it
//! with the new variables and credentials.
//!
//! Which Secrets are referenced is answered from reflector caches of the
//! provider kinds; events for any other Secret are dropped without touching
//! the API server.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;
use std::time::Duration;

use capi_operator_common::crd::{ProviderObject, SecretReference};
use capi_operator_common::{Error, OBSERVED_SECRET_HASH_ANNOTATION};
use capi_operator_provider::sources::secret_data_hash;
use capi_operator_provider::ProviderRegistry;
use futures::future::BoxFuture;
use futures::StreamExt;
use k8s_openapi::api::core::v1::Secret;
use kube::api::DynamicObject;
use kube::runtime::reflector::{self, store::Writer, Store};
use kube::runtime::watcher::{self, Event};
use kube::runtime::WatchStreamExt;
use kube::{Api, Client, ResourceExt};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::store::ProviderStore;

/// Pause after a watch error before polling the stream again
const WATCH_ERROR_DELAY: Duration = Duration::from_secs(5);

/// Namespace and name of a Secret
#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct SecretKey {
    /// Namespace
    pub namespace: String,
    /// Name
    pub name: String,
}

impl SecretKey {
    /// Key of a watched Secret
    pub fn of(secret: &Secret) -> Self {
        Self {
            namespace: secret.namespace().unwrap_or_default(),
            name: secret.name_any(),
        }
    }
}

impl std::fmt::Display for SecretKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}/{}", self.namespace, self.name)
    }
}

/// The Secret a provider's `configSecret` resolves to.
///
/// A reference without a namespace points into the provider's namespace.
pub fn referenced_secret(provider: &ProviderObject) -> Option<SecretKey> {
    let reference = provider.spec.config_secret.as_ref()?;
    let namespace = reference
        .namespace
        .as_deref()
        .filter(|ns| !ns.is_empty())
        .unwrap_or_else(|| provider.namespace());
    Some(SecretKey {
        namespace: namespace.to_string(),
        name: reference.name.clone(),
    })
}

/// The Secret a kind-erased provider object references, if any
pub fn referenced_secret_of(object: &DynamicObject) -> Option<SecretKey> {
    let reference: SecretReference = object
        .data
        .get("spec")
        .and_then(|spec| spec.get("configSecret"))
        .and_then(|r| serde_json::from_value(r.clone()).ok())?;
    let namespace = reference
        .namespace
        .filter(|ns| !ns.is_empty())
        .or_else(|| object.namespace())?;
    Some(SecretKey {
        namespace,
        name: reference.name,
    })
}

/// Secrets referenced by providers of any kind, from reflector caches
#[derive(Clone)]
pub struct ReferenceIndex {
    stores: Vec<Store<DynamicObject>>,
}

impl ReferenceIndex {
    /// Start caching every registered provider kind.
    ///
    /// The returned future drives the caches and must be polled for the
    /// index to fill.
    pub fn start(client: &Client, registry: &ProviderRegistry) -> (Self, BoxFuture<'static, ()>) {
        let mut stores = Vec::new();
        let mut drivers = Vec::new();
        for info in registry.iter() {
            let resource = info.api_resource();
            let api: Api<DynamicObject> = Api::all_with(client.clone(), &resource);
            let writer = Writer::new(resource);
            stores.push(writer.as_reader());
            let kind = info.provider_type.kind();
            drivers.push(
                reflector::reflector(
                    writer,
                    watcher::watcher(api, watcher::Config::default().timeout(25)).default_backoff(),
                )
                .for_each(move |event| {
                    if let Err(e) = event {
                        warn!(kind, error = %e, "provider cache watch error");
                    }
                    std::future::ready(())
                }),
            );
        }
        let driver = Box::pin(async move {
            futures::future::join_all(drivers).await;
        });
        (Self { stores }, driver)
    }

    /// Wait until every cache has completed its first listing
    pub async fn ready(&self) {
        for store in &self.stores {
            if store.wait_until_ready().await.is_err() {
                warn!("provider cache dropped before it was ready");
            }
        }
    }

    /// Currently referenced Secrets
    pub fn referenced(&self) -> BTreeSet<SecretKey> {
        self.stores
            .iter()
            .flat_map(|store| store.state())
            .filter_map(|object| referenced_secret_of(&object))
            .collect()
    }
}

/// Providers whose observed hash must change, paired with the new hash.
///
/// `hash_of` answers for the Secrets the caller has news about and returns
/// `None` for the rest, whose providers are left alone.
pub fn pending_updates<'a>(
    providers: &'a [ProviderObject],
    hash_of: impl Fn(&SecretKey) -> Option<String>,
) -> Vec<(&'a ProviderObject, String)> {
    providers
        .iter()
        .filter(|p| !p.is_deleting())
        .filter_map(|p| {
            let hash = hash_of(&referenced_secret(p)?)?;
            (p.annotation(OBSERVED_SECRET_HASH_ANNOTATION) != Some(hash.as_str())).then_some((p, hash))
        })
        .collect()
}

/// Stamp new hashes onto the affected providers.
///
/// Returns how many providers were updated. A failed write is logged and the
/// rest continue; the next event for the Secret retries it.
pub async fn propagate(
    store: &dyn ProviderStore,
    hash_of: impl Fn(&SecretKey) -> Option<String>,
) -> Result<usize, Error> {
    let providers = store.list_all().await?;
    let mut updated = 0;
    for (provider, hash) in pending_updates(&providers, hash_of) {
        match store
            .set_annotation(provider, OBSERVED_SECRET_HASH_ANNOTATION, &hash)
            .await
        {
            Ok(()) => {
                info!(provider = %provider.key(), kind = %provider.provider_type, "config secret changed");
                updated += 1;
            }
            Err(e) => {
                warn!(provider = %provider.key(), error = %e, "failed to record config secret hash");
            }
        }
    }
    Ok(updated)
}

/// Propagate a single Secret's current state; `None` means it was deleted.
pub async fn propagate_one(
    store: &dyn ProviderStore,
    key: &SecretKey,
    secret: Option<&Secret>,
) -> Result<usize, Error> {
    let hash = secret_data_hash(secret);
    propagate(store, |k| (k == key).then(|| hash.clone())).await
}

/// Propagate a complete listing of Secrets.
///
/// Every referenced Secret absent from `hashes` is missing and gets the
/// empty hash.
pub async fn propagate_all(
    store: &dyn ProviderStore,
    hashes: &BTreeMap<SecretKey, String>,
) -> Result<usize, Error> {
    propagate(store, |k| Some(hashes.get(k).cloned().unwrap_or_default())).await
}

/// Run the propagator until `shutdown` fires.
pub async fn run_secret_propagator(
    client: Client,
    registry: &'static ProviderRegistry,
    store: Arc<dyn ProviderStore>,
    shutdown: CancellationToken,
) {
    let (index, caches) = ReferenceIndex::start(&client, registry);
    let caches = tokio::spawn(caches);
    tokio::select! {
        _ = shutdown.cancelled() => {
            caches.abort();
            return;
        }
        _ = index.ready() => {}
    }

    let secrets: Api<Secret> = Api::all(client);
    let stream = watcher::watcher(secrets, watcher::Config::default().timeout(25));
    let mut stream = std::pin::pin!(stream);
    let mut initial: Option<BTreeMap<SecretKey, String>> = None;

    info!("Secret propagator started");

    loop {
        tokio::select! {
            _ = shutdown.cancelled() => {
                info!("Secret propagator stopped");
                caches.abort();
                return;
            }
            event = stream.next() => {
                let Some(event) = event else {
                    warn!("Secret watch stream ended");
                    caches.abort();
                    return;
                };
                handle_event(store.as_ref(), &index.referenced(), &mut initial, event).await;
            }
        }
    }
}

async fn handle_event(
    store: &dyn ProviderStore,
    referenced: &BTreeSet<SecretKey>,
    initial: &mut Option<BTreeMap<SecretKey, String>>,
    event: Result<Event<Secret>, watcher::Error>,
) {
    let result = match event {
        Ok(Event::Init) => {
            *initial = Some(BTreeMap::new());
            return;
        }
        Ok(Event::InitApply(secret)) => {
            let key = SecretKey::of(&secret);
            if let (Some(hashes), true) = (initial.as_mut(), referenced.contains(&key)) {
                hashes.insert(key, secret_data_hash(Some(&secret)));
            }
            return;
        }
        Ok(Event::InitDone) => {
            let hashes = initial.take().unwrap_or_default();
            debug!(secrets = hashes.len(), "Secret watch initialized");
            if referenced.is_empty() {
                return;
            }
            propagate_all(store, &hashes).await
        }
        Ok(Event::Apply(secret)) => {
            let key = SecretKey::of(&secret);
            if !referenced.contains(&key) {
                return;
            }
            propagate_one(store, &key, Some(&secret)).await
        }
        Ok(Event::Delete(secret)) => {
            let key = SecretKey::of(&secret);
            if !referenced.contains(&key) {
                return;
            }
            propagate_one(store, &key, None).await
        }
        Err(e) => {
            warn!(error = %e, "Secret watch error, will retry");
            tokio::time::sleep(WATCH_ERROR_DELAY).await;
            return;
        }
    };
    if let Err(e) = result {
        warn!(error = %e, "failed to propagate config secret change");
    }
}
