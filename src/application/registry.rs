use crate::session::{CapabilityInvoker, SessionError};
use crate::types::CapabilityDescriptor;
use async_trait::async_trait;
use futures::future::join_all;
use serde_json::{Value, json};
use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use thiserror::Error;
use tracing::{debug, info, warn};

#[derive(Debug, Error)]
pub enum RegistryError {
    #[error("capability '{name}' is already registered")]
    DuplicateName { name: String },
}

#[derive(Debug, Error)]
pub enum DiscoveryError {
    #[error(transparent)]
    Session(#[from] SessionError),
    #[error(transparent)]
    Registry(#[from] RegistryError),
}

/// Deployment policy for capability name collisions across backends.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum CollisionPolicy {
    /// A second registration of an existing name is rejected.
    #[default]
    Reject,
    /// A colliding name is registered as `"{backend_key}.{name}"` instead.
    NamespaceByBackend,
}

/// A capability the orchestrator's own process can execute directly.
#[async_trait]
pub trait LocalHandler: Send + Sync {
    async fn call(&self, arguments: Value) -> Result<Value, String>;
}

/// Adapter turning a plain function into a `LocalHandler`.
pub struct FnHandler<F>(pub F);

#[async_trait]
impl<F> LocalHandler for FnHandler<F>
where
    F: Fn(Value) -> Result<Value, String> + Send + Sync,
{
    async fn call(&self, arguments: Value) -> Result<Value, String> {
        (self.0)(arguments)
    }
}

// Dispatch is an explicit match over this tag; proxies are data, not
// generated code.
enum CapabilityEntry {
    Local(Arc<dyn LocalHandler>),
    Remote {
        session: Arc<dyn CapabilityInvoker>,
        capability: String,
    },
}

struct RegisteredCapability {
    descriptor: CapabilityDescriptor,
    entry: CapabilityEntry,
}

/// Aggregates capabilities from local handlers and discovered backends into
/// one namespace. Constructed explicitly and shared via `Arc`; read-only for
/// conversations once populated.
pub struct CapabilityRegistry {
    policy: CollisionPolicy,
    entries: Mutex<HashMap<String, Arc<RegisteredCapability>>>,
}

impl Default for CapabilityRegistry {
    fn default() -> Self {
        Self::new(CollisionPolicy::default())
    }
}

impl CapabilityRegistry {
    pub fn new(policy: CollisionPolicy) -> Self {
        Self {
            policy,
            entries: Mutex::new(HashMap::new()),
        }
    }

    /// Registers a capability backed by an in-process handler.
    pub fn register_local(
        &self,
        descriptor: CapabilityDescriptor,
        handler: Arc<dyn LocalHandler>,
    ) -> Result<(), RegistryError> {
        self.insert(None, descriptor, CapabilityEntry::Local(handler))
    }

    /// Lists `session`'s capabilities and registers a proxy for each. The
    /// proxy forwards invocations to the owning backend and never leaks
    /// transport failures to the caller. A collision is raised here, at
    /// registration time, before any conversation can use either side.
    pub async fn discover_and_register(
        &self,
        backend_key: &str,
        session: Arc<dyn CapabilityInvoker>,
    ) -> Result<usize, DiscoveryError> {
        let descriptors = session.list_capabilities().await?;
        let count = descriptors.len();
        for descriptor in descriptors {
            let remote_name = descriptor.name.clone();
            self.insert(
                Some(backend_key),
                descriptor,
                CapabilityEntry::Remote {
                    session: Arc::clone(&session),
                    capability: remote_name,
                },
            )?;
        }
        info!(backend = backend_key, count, "registered backend capabilities");
        Ok(count)
    }

    /// Discovers every backend concurrently; one backend's failure leaves
    /// the others registered. Returns per-backend results in input order.
    pub async fn discover_all(
        &self,
        targets: Vec<(String, Arc<dyn CapabilityInvoker>)>,
    ) -> Vec<(String, Result<usize, DiscoveryError>)> {
        let discoveries = targets.into_iter().map(|(key, session)| async move {
            let result = self.discover_and_register(&key, session).await;
            if let Err(err) = &result {
                warn!(backend = %key, %err, "backend discovery failed");
            }
            (key, result)
        });
        join_all(discoveries).await
    }

    /// Executes a registered capability and always returns a well-formed
    /// payload: an unregistered name or any handler/transport failure
    /// becomes a `{"error": ...}` result for the conversation to carry.
    pub async fn invoke(&self, name: &str, arguments: Value) -> Value {
        let Some(registered) = self.resolve(name) else {
            warn!(capability = name, "invocation of unknown capability");
            return json!({"error": format!("unknown capability '{name}'")});
        };

        match &registered.entry {
            CapabilityEntry::Local(handler) => match handler.call(arguments).await {
                Ok(payload) => payload,
                Err(message) => {
                    warn!(capability = name, error = %message, "local handler failed");
                    json!({"error": message})
                }
            },
            CapabilityEntry::Remote {
                session,
                capability,
            } => match session.invoke(capability, arguments).await {
                Ok(payload) => payload,
                Err(err) => {
                    warn!(
                        capability = name,
                        backend = session.backend(),
                        %err,
                        "proxy invocation failed"
                    );
                    json!({"error": err.to_string()})
                }
            },
        }
    }

    pub fn contains(&self, name: &str) -> bool {
        self.lock_entries().contains_key(name)
    }

    pub fn len(&self) -> usize {
        self.lock_entries().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Name-sorted descriptor snapshot for the schema adapter.
    pub fn descriptors(&self) -> Vec<CapabilityDescriptor> {
        let entries = self.lock_entries();
        let mut descriptors: Vec<CapabilityDescriptor> = entries
            .values()
            .map(|registered| registered.descriptor.clone())
            .collect();
        descriptors.sort_by(|a, b| a.name.cmp(&b.name));
        descriptors
    }

    fn resolve(&self, name: &str) -> Option<Arc<RegisteredCapability>> {
        self.lock_entries().get(name).cloned()
    }

    fn lock_entries(&self) -> MutexGuard<'_, HashMap<String, Arc<RegisteredCapability>>> {
        self.entries.lock().unwrap_or_else(PoisonError::into_inner)
    }

    // Insertion is atomic per name: the map lock is held across the
    // collision check and the write.
    fn insert(
        &self,
        backend_key: Option<&str>,
        mut descriptor: CapabilityDescriptor,
        entry: CapabilityEntry,
    ) -> Result<(), RegistryError> {
        let mut entries = self.lock_entries();

        if entries.contains_key(&descriptor.name) {
            match (self.policy, backend_key) {
                (CollisionPolicy::NamespaceByBackend, Some(key)) => {
                    let namespaced = format!("{key}.{}", descriptor.name);
                    debug!(
                        original = %descriptor.name,
                        renamed = %namespaced,
                        "namespacing colliding capability"
                    );
                    if entries.contains_key(&namespaced) {
                        return Err(RegistryError::DuplicateName { name: namespaced });
                    }
                    descriptor.name = namespaced;
                }
                _ => {
                    return Err(RegistryError::DuplicateName {
                        name: descriptor.name,
                    });
                }
            }
        }

        entries.insert(
            descriptor.name.clone(),
            Arc::new(RegisteredCapability { descriptor, entry }),
        );
        Ok(())
    }
}
