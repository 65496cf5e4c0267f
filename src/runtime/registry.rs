//! Generic versioned registry for orchestrations, activities and entities
//!
//! Orchestrations can be registered at explicit semver versions and resolved
//! through a [`VersionPolicy`]. Activities and entities always live at 1.0.0
//! with the `Latest` policy.

use super::{ActivityHandler, EntityHandler, FnActivity, FnEntity, FnOrchestration, OrchestrationHandler};
use crate::_typed_codec::Codec;
use crate::entity::{EntityContext, EntityError};
use crate::OrchestrationContext;
use semver::Version;
use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Mutex, MutexGuard};

const DEFAULT_VERSION: Version = Version::new(1, 0, 0);

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum VersionPolicy {
    Latest,
    Exact(Version),
}

/// Name to versioned handler map, shared cheaply by clone.
pub struct Registry<H: ?Sized> {
    pub(crate) inner: Arc<HashMap<String, BTreeMap<Version, Arc<H>>>>,
    pub(crate) policy: Arc<Mutex<HashMap<String, VersionPolicy>>>,
}

// H: ?Sized rules out the derive
impl<H: ?Sized> Clone for Registry<H> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
            policy: Arc::clone(&self.policy),
        }
    }
}

impl<H: ?Sized> Default for Registry<H> {
    fn default() -> Self {
        Self {
            inner: Arc::new(HashMap::new()),
            policy: Arc::new(Mutex::new(HashMap::new())),
        }
    }
}

pub struct RegistryBuilder<H: ?Sized> {
    map: HashMap<String, BTreeMap<Version, Arc<H>>>,
    policy: HashMap<String, VersionPolicy>,
    errors: Vec<String>,
}

pub type OrchestrationRegistry = Registry<dyn OrchestrationHandler>;
pub type ActivityRegistry = Registry<dyn ActivityHandler>;
pub type EntityRegistry = Registry<dyn EntityHandler>;
pub type OrchestrationRegistryBuilder = RegistryBuilder<dyn OrchestrationHandler>;
pub type ActivityRegistryBuilder = RegistryBuilder<dyn ActivityHandler>;
pub type EntityRegistryBuilder = RegistryBuilder<dyn EntityHandler>;

impl<H: ?Sized> Registry<H> {
    pub fn builder() -> RegistryBuilder<H> {
        RegistryBuilder {
            map: HashMap::new(),
            policy: HashMap::new(),
            errors: Vec::new(),
        }
    }

    pub fn builder_from(reg: &Registry<H>) -> RegistryBuilder<H> {
        RegistryBuilder {
            map: reg.inner.as_ref().clone(),
            policy: reg.policies().clone(),
            errors: Vec::new(),
        }
    }

    fn policies(&self) -> MutexGuard<'_, HashMap<String, VersionPolicy>> {
        self.policy.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Resolve a handler through the name's version policy.
    pub fn resolve_handler(&self, name: &str) -> Option<(Version, Arc<H>)> {
        let pol = self.policies().get(name).cloned().unwrap_or(VersionPolicy::Latest);

        let result = match &pol {
            VersionPolicy::Latest => self
                .inner
                .get(name)
                .and_then(|m| m.iter().next_back())
                .map(|(v, h)| (v.clone(), Arc::clone(h))),
            VersionPolicy::Exact(v) => self
                .inner
                .get(name)
                .and_then(|versions| versions.get(v))
                .map(|h| (v.clone(), Arc::clone(h))),
        };

        if result.is_none() {
            self.log_registry_miss(name, None, Some(&pol));
        }
        result
    }

    pub fn resolve_version(&self, name: &str) -> Option<Version> {
        self.resolve_handler(name).map(|(v, _h)| v)
    }

    pub fn resolve_handler_exact(&self, name: &str, v: &Version) -> Option<Arc<H>> {
        let result = self.inner.get(name).and_then(|versions| versions.get(v).cloned());
        if result.is_none() {
            self.log_registry_miss(name, Some(v), None);
        }
        result
    }

    /// Latest-policy lookup for handlers that are not versioned.
    pub fn get(&self, name: &str) -> Option<Arc<H>> {
        self.resolve_handler(name).map(|(_, h)| h)
    }

    pub fn set_version_policy(&self, name: &str, policy: VersionPolicy) {
        self.policies().insert(name.to_string(), policy);
    }

    pub fn list_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.inner.keys().cloned().collect();
        names.sort();
        names
    }

    pub fn list_versions(&self, name: &str) -> Vec<Version> {
        self.inner
            .get(name)
            .map(|m| m.keys().cloned().collect())
            .unwrap_or_default()
    }

    pub fn has(&self, name: &str) -> bool {
        self.inner.contains_key(name)
    }

    pub fn count(&self) -> usize {
        self.inner.len()
    }

    fn log_registry_miss(&self, name: &str, requested_version: Option<&Version>, requested_policy: Option<&VersionPolicy>) {
        tracing::debug!(
            target: "durable_e2e::runtime::registry",
            requested_name = %name,
            requested_version = ?requested_version,
            requested_policy = ?requested_policy,
            available_versions_for_name = ?self.list_versions(name),
            registered_names = ?self.list_names(),
            "Registry lookup miss"
        );
    }
}

impl<H: ?Sized> RegistryBuilder<H> {
    pub fn build(self) -> Registry<H> {
        Registry {
            inner: Arc::new(self.map),
            policy: Arc::new(Mutex::new(self.policy)),
        }
    }

    /// Build, failing when any registration was rejected.
    ///
    /// # Errors
    ///
    /// Returns every collected registration error joined with `"; "`.
    pub fn build_result(self) -> Result<Registry<H>, String> {
        if self.errors.is_empty() {
            Ok(self.build())
        } else {
            Err(self.errors.join("; "))
        }
    }

    pub fn errors(&self) -> &[String] {
        &self.errors
    }

    fn merge_registry(mut self, other: Registry<H>, error_prefix: &str) -> Self {
        for (name, versions) in other.inner.iter() {
            let entry = self.map.entry(name.clone()).or_default();
            for (version, handler) in versions.iter() {
                if entry.contains_key(version) {
                    self.errors
                        .push(format!("duplicate {error_prefix} in merge: {name}@{version}"));
                } else {
                    entry.insert(version.clone(), Arc::clone(handler));
                }
            }
        }
        self
    }

    /// Record an error and return true if `name@version` is taken.
    fn check_duplicate(&mut self, name: &str, version: &Version, error_prefix: &str) -> bool {
        let taken = self.map.get(name).is_some_and(|m| m.contains_key(version));
        if taken {
            self.errors
                .push(format!("duplicate {error_prefix} registration: {name}@{version}"));
        }
        taken
    }

    fn insert_default(&mut self, name: String, handler: Arc<H>, error_prefix: &str) {
        if self.check_duplicate(&name, &DEFAULT_VERSION, error_prefix) {
            return;
        }
        self.map.entry(name.clone()).or_default().insert(DEFAULT_VERSION, handler);
        self.policy.insert(name, VersionPolicy::Latest);
    }
}

impl OrchestrationRegistryBuilder {
    pub fn register<F, Fut>(mut self, name: impl Into<String>, f: F) -> Self
    where
        F: Fn(OrchestrationContext, String) -> Fut + Send + Sync + 'static,
        Fut: std::future::Future<Output = Result<String, String>> + Send + 'static,
    {
        self.insert_default(name.into(), Arc::new(FnOrchestration(f)), "orchestration");
        self
    }

    pub fn register_typed<In, Out, F, Fut>(self, name: impl Into<String>, f: F) -> Self
    where
        In: serde::de::DeserializeOwned + Send + 'static,
        Out: serde::Serialize + Send + 'static,
        F: Fn(OrchestrationContext, In) -> Fut + Send + Sync + 'static,
        Fut: std::future::Future<Output = Result<Out, String>> + Send + 'static,
    {
        let f = Arc::new(f);
        self.register(name, move |ctx: OrchestrationContext, input_s: String| {
            let f = Arc::clone(&f);
            async move {
                let input: In = crate::_typed_codec::Json::decode(&input_s)?;
                let out: Out = f(ctx, input).await?;
                crate::_typed_codec::Json::encode(&out)
            }
        })
    }

    /// Register at an explicit version; versions must increase per name.
    pub fn register_versioned<F, Fut>(mut self, name: impl Into<String>, version: impl AsRef<str>, f: F) -> Self
    where
        F: Fn(OrchestrationContext, String) -> Fut + Send + Sync + 'static,
        Fut: std::future::Future<Output = Result<String, String>> + Send + 'static,
    {
        let name = name.into();
        let v = match Version::parse(version.as_ref()) {
            Ok(v) => v,
            Err(e) => {
                self.errors
                    .push(format!("invalid version for orchestration {name}: {}: {e}", version.as_ref()));
                return self;
            }
        };
        if self.check_duplicate(&name, &v, "orchestration") {
            return self;
        }
        let entry = self.map.entry(name.clone()).or_default();
        if let Some((latest, _)) = entry.iter().next_back()
            && &v <= latest
        {
            self.errors.push(format!(
                "non-monotonic orchestration version for {name}: {v} is not later than existing latest {latest}"
            ));
            return self;
        }
        entry.insert(v, Arc::new(FnOrchestration(f)));
        self
    }

    pub fn merge(self, other: OrchestrationRegistry) -> Self {
        self.merge_registry(other, "orchestration")
    }

    pub fn set_policy(mut self, name: impl Into<String>, policy: VersionPolicy) -> Self {
        self.policy.insert(name.into(), policy);
        self
    }
}

impl ActivityRegistryBuilder {
    pub fn register<F, Fut>(mut self, name: impl Into<String>, f: F) -> Self
    where
        F: Fn(crate::ActivityContext, String) -> Fut + Send + Sync + 'static,
        Fut: std::future::Future<Output = Result<String, String>> + Send + 'static,
    {
        self.insert_default(name.into(), Arc::new(FnActivity(f)), "activity");
        self
    }

    pub fn register_typed<In, Out, F, Fut>(self, name: impl Into<String>, f: F) -> Self
    where
        In: serde::de::DeserializeOwned + Send + 'static,
        Out: serde::Serialize + Send + 'static,
        F: Fn(crate::ActivityContext, In) -> Fut + Send + Sync + 'static,
        Fut: std::future::Future<Output = Result<Out, String>> + Send + 'static,
    {
        let f = Arc::new(f);
        self.register(name, move |ctx: crate::ActivityContext, input_s: String| {
            let f = Arc::clone(&f);
            async move {
                let input: In = crate::_typed_codec::Json::decode(&input_s)?;
                let out: Out = f(ctx, input).await?;
                crate::_typed_codec::Json::encode(&out)
            }
        })
    }

    pub fn merge(self, other: ActivityRegistry) -> Self {
        self.merge_registry(other, "activity")
    }
}

impl EntityRegistryBuilder {
    /// Register the handler for every key of entity `name`; it dispatches on `ctx.operation()`.
    pub fn register<F, Fut>(mut self, name: impl Into<String>, f: F) -> Self
    where
        F: Fn(EntityContext) -> Fut + Send + Sync + 'static,
        Fut: std::future::Future<Output = Result<String, EntityError>> + Send + 'static,
    {
        self.insert_default(name.into(), Arc::new(FnEntity(f)), "entity");
        self
    }

    pub fn merge(self, other: EntityRegistry) -> Self {
        self.merge_registry(other, "entity")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Test: duplicate registrations are collected and fail build_result
    #[test]
    fn test_duplicate_registration_is_collected() {
        let result = ActivityRegistry::builder()
            .register("A", |_ctx: crate::ActivityContext, s: String| async move { Ok(s) })
            .register("A", |_ctx: crate::ActivityContext, s: String| async move { Ok(s) })
            .build_result();
        let err = result.err().unwrap();
        assert_eq!(err, "duplicate activity registration: A@1.0.0");
    }

    /// Test: latest policy picks the highest version and exact pins one
    #[test]
    fn test_version_policy_resolution() {
        let reg = OrchestrationRegistry::builder()
            .register("O", |_ctx: OrchestrationContext, _s: String| async move { Ok("v1".to_string()) })
            .register_versioned("O", "2.0.0", |_ctx: OrchestrationContext, _s: String| async move {
                Ok("v2".to_string())
            })
            .build();
        assert_eq!(reg.resolve_version("O"), Some(Version::new(2, 0, 0)));

        reg.set_version_policy("O", VersionPolicy::Exact(Version::new(1, 0, 0)));
        assert_eq!(reg.resolve_version("O"), Some(Version::new(1, 0, 0)));
        assert!(reg.resolve_handler("Missing").is_none());
        assert_eq!(reg.list_versions("O").len(), 2);
    }

    /// Test: versions must increase and parse as semver
    #[test]
    fn test_versioned_registration_errors() {
        let builder = OrchestrationRegistry::builder()
            .register_versioned("O", "2.0.0", |_ctx: OrchestrationContext, s: String| async move { Ok(s) })
            .register_versioned("O", "1.5.0", |_ctx: OrchestrationContext, s: String| async move { Ok(s) })
            .register_versioned("P", "not-a-version", |_ctx: OrchestrationContext, s: String| async move {
                Ok(s)
            });
        assert_eq!(builder.errors().len(), 2);
        assert!(builder.errors()[0].starts_with("non-monotonic orchestration version for O"));
    }

    /// Test: merging registries keeps both sides and flags collisions
    #[test]
    fn test_merge_registries() {
        let a = EntityRegistry::builder()
            .register("Counter", |_ctx: EntityContext| async move { Ok(String::new()) })
            .build();
        let b = EntityRegistry::builder()
            .register("Counter", |_ctx: EntityContext| async move { Ok(String::new()) })
            .register("Other", |_ctx: EntityContext| async move { Ok(String::new()) })
            .build();
        let merged = EntityRegistry::builder_from(&a).merge(b);
        assert_eq!(merged.errors(), ["duplicate entity in merge: Counter@1.0.0".to_string()]);
        let reg = merged.build();
        assert!(reg.has("Other"));
        assert_eq!(reg.count(), 2);
    }
}
