//! Environment registry: `register`, `spec` and `make`
//!
//! Environments are looked up by IDs of the form `[namespace/]name[-vN]`.
//! Version resolution is strict: asking for a version newer than anything
//! registered is an error listing the known versions, asking for an older
//! superseded version is a deprecation error, and an unversioned lookup of a
//! versioned name resolves to the newest version with a warning.

use std::collections::{BTreeSet, HashMap};
use std::fmt;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use lazy_static::lazy_static;
use regex::Regex;

use gymkit_core::{
    EnvMetadata, Environment, EnvironmentConfig, GymError, RenderFrame, ResetOptions, Result,
    Sample, Space, Step, StepInfo,
};

use crate::classic::{CartPoleEnv, MountainCarContinuousEnv, MountainCarEnv, PendulumEnv};
use crate::wrappers::{OrderEnforcing, TimeLimit};

/// Constructor stored in an [`EnvSpec`]
pub type EnvConstructor =
    Arc<dyn Fn(EnvironmentConfig) -> Result<Box<dyn Environment>> + Send + Sync>;

lazy_static! {
    static ref ENV_ID_RE: Regex =
        Regex::new(r"^(?:([\w:-]+)/)?([\w:.-]+?)(?:-v(\d+))?$").unwrap();
    static ref REGISTRY: Mutex<EnvRegistry> = Mutex::new(EnvRegistry::with_defaults());
}

/// Suggestions further away than this are not offered
const SUGGESTION_CUTOFF: usize = 4;

/// A parsed environment ID
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct EnvId {
    /// Optional namespace
    pub namespace: Option<String>,
    /// Environment name
    pub name: String,
    /// Optional version
    pub version: Option<u32>,
}

impl EnvId {
    /// Parse an ID of the form `[namespace/]name[-vN]`
    pub fn parse(id: &str) -> Result<Self> {
        let captures = ENV_ID_RE
            .captures(id)
            .ok_or_else(|| GymError::MalformedId(id.to_string()))?;
        let version = match captures.get(3) {
            Some(m) => Some(
                m.as_str()
                    .parse::<u32>()
                    .map_err(|_| GymError::MalformedId(id.to_string()))?,
            ),
            None => None,
        };
        Ok(Self {
            namespace: captures.get(1).map(|m| m.as_str().to_string()),
            name: captures[2].to_string(),
            version,
        })
    }

    /// The namespaced name without a version suffix
    #[must_use]
    pub fn full_name(&self) -> String {
        match &self.namespace {
            Some(ns) => format!("{ns}/{}", self.name),
            None => self.name.clone(),
        }
    }
}

impl fmt::Display for EnvId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.full_name())?;
        if let Some(v) = self.version {
            write!(f, "-v{v}")?;
        }
        Ok(())
    }
}

/// Registration record for one environment
#[derive(Clone)]
pub struct EnvSpec {
    /// Parsed environment ID
    pub id: EnvId,
    /// Constructor, absent for placeholder registrations
    pub entry_point: Option<EnvConstructor>,
    /// Default construction parameters, overridable at `make` time
    pub kwargs: serde_json::Map<String, serde_json::Value>,
    /// Episode step limit applied through a `TimeLimit` wrapper
    pub max_episode_steps: Option<usize>,
    /// Return at which the task counts as solved
    pub reward_threshold: Option<f64>,
    /// Whether the environment is nondeterministic even when seeded
    pub nondeterministic: bool,
}

impl EnvSpec {
    /// Create a spec for the given ID
    pub fn new(id: &str) -> Result<Self> {
        Ok(Self {
            id: EnvId::parse(id)?,
            entry_point: None,
            kwargs: serde_json::Map::new(),
            max_episode_steps: None,
            reward_threshold: None,
            nondeterministic: false,
        })
    }

    /// Set the constructor
    #[must_use]
    pub fn entry_point<F>(mut self, constructor: F) -> Self
    where
        F: Fn(EnvironmentConfig) -> Result<Box<dyn Environment>> + Send + Sync + 'static,
    {
        self.entry_point = Some(Arc::new(constructor));
        self
    }

    /// Set a default construction parameter
    #[must_use]
    pub fn kwarg(mut self, key: impl Into<String>, value: serde_json::Value) -> Self {
        self.kwargs.insert(key.into(), value);
        self
    }

    /// Set the episode step limit
    #[must_use]
    pub fn max_episode_steps(mut self, steps: usize) -> Self {
        self.max_episode_steps = Some(steps);
        self
    }

    /// Set the solved threshold
    #[must_use]
    pub fn reward_threshold(mut self, threshold: f64) -> Self {
        self.reward_threshold = Some(threshold);
        self
    }
}

impl fmt::Debug for EnvSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EnvSpec")
            .field("id", &self.id)
            .field("entry_point", &self.entry_point.as_ref().map(|_| "<fn>"))
            .field("kwargs", &self.kwargs)
            .field("max_episode_steps", &self.max_episode_steps)
            .field("reward_threshold", &self.reward_threshold)
            .field("nondeterministic", &self.nondeterministic)
            .finish()
    }
}

fn edit_distance(a: &str, b: &str) -> usize {
    let a: Vec<char> = a.chars().collect();
    let b: Vec<char> = b.chars().collect();
    let mut prev: Vec<usize> = (0..=b.len()).collect();
    let mut curr = vec![0; b.len() + 1];
    for (i, ca) in a.iter().enumerate() {
        curr[0] = i + 1;
        for (j, cb) in b.iter().enumerate() {
            let cost = usize::from(ca != cb);
            curr[j + 1] = (prev[j] + cost).min(prev[j + 1] + 1).min(curr[j] + 1);
        }
        std::mem::swap(&mut prev, &mut curr);
    }
    prev[b.len()]
}

fn closest<I: IntoIterator<Item = String>>(target: &str, candidates: I) -> Option<String> {
    let target_lower = target.to_lowercase();
    candidates
        .into_iter()
        .collect::<BTreeSet<_>>()
        .into_iter()
        .map(|c| (edit_distance(&target_lower, &c.to_lowercase()), c))
        .filter(|(d, _)| *d <= SUGGESTION_CUTOFF)
        .min_by_key(|(d, _)| *d)
        .map(|(_, c)| c)
}

/// Attaches the registry ID to a constructed environment
struct SpecTagged {
    env: Box<dyn Environment>,
    id: String,
}

#[async_trait]
impl Environment for SpecTagged {
    fn observation_space(&self) -> Space {
        self.env.observation_space()
    }

    fn action_space(&self) -> Space {
        self.env.action_space()
    }

    fn metadata(&self) -> EnvMetadata {
        self.env.metadata()
    }

    fn spec_id(&self) -> Option<&str> {
        Some(&self.id)
    }

    async fn reset(&mut self, options: ResetOptions) -> Result<(Sample, StepInfo)> {
        self.env.reset(options).await
    }

    async fn step(&mut self, action: &Sample) -> Result<Step> {
        self.env.step(action).await
    }

    async fn render(&mut self, mode: &str) -> Result<RenderFrame> {
        self.env.render(mode).await
    }

    async fn close(&mut self) -> Result<()> {
        self.env.close().await
    }
}

/// Environment registry
pub struct EnvRegistry {
    specs: HashMap<String, EnvSpec>,
    current_namespace: Option<String>,
}

impl Default for EnvRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl EnvRegistry {
    /// Create an empty registry
    #[must_use]
    pub fn new() -> Self {
        Self {
            specs: HashMap::new(),
            current_namespace: None,
        }
    }

    /// Create a registry preloaded with the classic-control environments
    #[must_use]
    pub fn with_defaults() -> Self {
        let mut registry = Self::new();
        for spec in default_specs() {
            // Default IDs are well-formed and unique
            registry.register(spec).unwrap();
        }
        registry
    }

    /// Register an environment spec
    pub fn register(&mut self, mut spec: EnvSpec) -> Result<()> {
        if spec.id.namespace.is_none() {
            spec.id.namespace = self.current_namespace.clone();
        }
        let key = spec.id.to_string();
        if self.specs.contains_key(&key) {
            return Err(GymError::Registration(format!(
                "Cannot re-register ID `{key}`"
            )));
        }
        let clash = self.specs.values().find(|existing| {
            existing.id.namespace == spec.id.namespace
                && existing.id.name == spec.id.name
                && existing.id.version.is_some() != spec.id.version.is_some()
        });
        if let Some(existing) = clash {
            let (kind, other) = if spec.id.version.is_some() {
                ("versioned", "unversioned")
            } else {
                ("unversioned", "versioned")
            };
            return Err(GymError::Registration(format!(
                "Can't register the {kind} environment `{key}` when the {other} environment `{}` of the same name already exists",
                existing.id
            )));
        }
        self.specs.insert(key, spec);
        Ok(())
    }

    /// Remove a registration, returning it if present
    pub fn deregister(&mut self, id: &str) -> Option<EnvSpec> {
        self.specs.remove(id)
    }

    /// Run `f` with a default namespace applied to new registrations
    pub fn with_namespace<F>(&mut self, namespace: &str, f: F) -> Result<()>
    where
        F: FnOnce(&mut EnvRegistry) -> Result<()>,
    {
        self.current_namespace = Some(namespace.to_string());
        let result = f(self);
        self.current_namespace = None;
        result
    }

    /// All registered IDs
    #[must_use]
    pub fn list(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.specs.keys().cloned().collect();
        ids.sort();
        ids
    }

    /// Look up a spec, resolving versions
    pub fn spec(&self, id: &str) -> Result<EnvSpec> {
        let env_id = EnvId::parse(id)?;
        if let Some(spec) = self.specs.get(&env_id.to_string()) {
            return Ok(spec.clone());
        }

        let mut versions: Vec<u32> = self
            .specs
            .values()
            .filter(|s| s.id.namespace == env_id.namespace && s.id.name == env_id.name)
            .filter_map(|s| s.id.version)
            .collect();
        versions.sort_unstable();
        let has_name = self
            .specs
            .values()
            .any(|s| s.id.namespace == env_id.namespace && s.id.name == env_id.name);
        if !has_name {
            return Err(self.unregistered(&env_id));
        }

        match (env_id.version, versions.last().copied()) {
            (Some(version), Some(latest)) => {
                if version > latest {
                    Err(GymError::VersionNotFound {
                        name: env_id.full_name(),
                        version,
                        known_versions: versions
                            .iter()
                            .map(|v| format!("`v{v}`"))
                            .collect::<Vec<_>>()
                            .join(", "),
                    })
                } else {
                    Err(GymError::DeprecatedEnv(format!(
                        "Environment version v{version} for `{}` is deprecated. Please use `{}-v{latest}` instead.",
                        env_id.full_name(),
                        env_id.full_name()
                    )))
                }
            }
            (Some(_), None) => Err(GymError::DeprecatedEnv(format!(
                "Environment `{}` can't be specified with a version number, it provides the default version.",
                env_id.full_name()
            ))),
            (None, Some(latest)) => {
                let key = EnvId {
                    version: Some(latest),
                    ..env_id
                }
                .to_string();
                Ok(self.specs[&key].clone())
            }
            (None, None) => Err(self.unregistered(&env_id)),
        }
    }

    fn unregistered(&self, env_id: &EnvId) -> GymError {
        if let Some(ns) = &env_id.namespace {
            let namespace_exists = self
                .specs
                .values()
                .any(|s| s.id.namespace.as_deref() == Some(ns.as_str()));
            if !namespace_exists {
                return GymError::Unregistered {
                    id: env_id.to_string(),
                    suggestion: closest(
                        ns,
                        self.specs.values().filter_map(|s| s.id.namespace.clone()),
                    ),
                };
            }
        }
        let names = self
            .specs
            .values()
            .filter(|s| s.id.namespace == env_id.namespace)
            .map(|s| s.id.name.clone());
        GymError::Unregistered {
            id: env_id.to_string(),
            suggestion: closest(&env_id.name, names),
        }
    }

    /// Construct a registered environment
    ///
    /// Call-site parameters override the registered kwargs. The returned
    /// environment is order-enforced and time-limited per its registration.
    pub fn make(
        &self,
        id: &str,
        mut config: EnvironmentConfig,
    ) -> Result<Box<dyn Environment>> {
        let spec = self.spec(id)?;
        if spec.id.version.is_some() && EnvId::parse(id)?.version.is_none() {
            tracing::warn!(
                requested = id,
                resolved = %spec.id,
                "using the latest versioned environment"
            );
        }

        let Some(constructor) = spec.entry_point.clone() else {
            return Err(GymError::Registration(format!(
                "`{}` is registered without an entry point and cannot be constructed",
                spec.id
            )));
        };

        let mut params = spec.kwargs.clone();
        for (key, value) in std::mem::take(&mut config.params) {
            params.insert(key, value);
        }
        config.params = params;
        let max_steps = config.max_steps.or(spec.max_episode_steps);
        let render_mode = config.render_mode.clone();

        let env = constructor(config)?;
        if let Some(mode) = render_mode {
            let metadata = env.metadata();
            if mode != "None" && !metadata.render_modes.iter().any(|m| *m == mode) {
                return Err(GymError::InvalidRenderMode {
                    mode,
                    valid_modes: metadata.valid_modes(),
                });
            }
        }

        let env = OrderEnforcing::new(SpecTagged {
            env,
            id: spec.id.to_string(),
        });
        Ok(match max_steps {
            Some(steps) => Box::new(TimeLimit::new(env, steps)),
            None => Box::new(env),
        })
    }
}

fn default_specs() -> Vec<EnvSpec> {
    vec![
        EnvSpec::new("CartPole-v1")
            .unwrap()
            .entry_point(|config| Ok(Box::new(CartPoleEnv::new(config)?) as Box<dyn Environment>))
            .max_episode_steps(500)
            .reward_threshold(475.0),
        EnvSpec::new("MountainCar-v0")
            .unwrap()
            .entry_point(|config| {
                Ok(Box::new(MountainCarEnv::new(config)?) as Box<dyn Environment>)
            })
            .max_episode_steps(200)
            .reward_threshold(-110.0),
        EnvSpec::new("MountainCarContinuous-v0")
            .unwrap()
            .entry_point(|config| {
                Ok(Box::new(MountainCarContinuousEnv::new(config)?) as Box<dyn Environment>)
            })
            .max_episode_steps(999)
            .reward_threshold(90.0),
        EnvSpec::new("Pendulum-v1")
            .unwrap()
            .entry_point(|config| Ok(Box::new(PendulumEnv::new(config)?) as Box<dyn Environment>))
            .max_episode_steps(200),
    ]
}

/// Register an environment in the global registry
pub fn register_env(spec: EnvSpec) -> Result<()> {
    REGISTRY.lock().unwrap().register(spec)
}

/// Remove an environment from the global registry
pub fn deregister_env(id: &str) -> Option<EnvSpec> {
    REGISTRY.lock().unwrap().deregister(id)
}

/// Look up a spec in the global registry
pub fn env_spec(id: &str) -> Result<EnvSpec> {
    REGISTRY.lock().unwrap().spec(id)
}

/// Construct an environment from the global registry
pub fn make_env(id: &str, config: EnvironmentConfig) -> Result<Box<dyn Environment>> {
    REGISTRY.lock().unwrap().make(id, config)
}

/// List all IDs in the global registry
pub fn list_envs() -> Vec<String> {
    REGISTRY.lock().unwrap().list()
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn argument_spec(id: &str) -> EnvSpec {
        EnvSpec::new(id)
            .unwrap()
            .entry_point(|config| Ok(Box::new(PendulumEnv::new(config)?) as Box<dyn Environment>))
    }

    #[test]
    fn test_parse_id_forms() {
        let cases = [
            ("MyAwesomeNamespace/MyAwesomeEnv-v0", Some("MyAwesomeNamespace"), "MyAwesomeEnv", Some(0)),
            ("MyAwesomeEnv-v0", None, "MyAwesomeEnv", Some(0)),
            ("MyAwesomeEnv", None, "MyAwesomeEnv", None),
            ("MyAwesomeEnv-vfinal-v0", None, "MyAwesomeEnv-vfinal", Some(0)),
            ("MyAwesomeEnv-vfinal", None, "MyAwesomeEnv-vfinal", None),
            ("MyAwesomeEnv--", None, "MyAwesomeEnv--", None),
            ("MyAwesomeEnv-v", None, "MyAwesomeEnv-v", None),
        ];
        for (id, namespace, name, version) in cases {
            let parsed = EnvId::parse(id).unwrap();
            assert_eq!(parsed.namespace.as_deref(), namespace, "{id}");
            assert_eq!(parsed.name, name, "{id}");
            assert_eq!(parsed.version, version, "{id}");
            assert_eq!(parsed.to_string(), id);
        }
    }

    #[test]
    fn test_malformed_ids() {
        for id in ["“Breakout-v0”", "MyNotSoAwesomeEnv-vNone\n", "MyNamespace///MyNotSoAwesomeEnv-vNone"] {
            assert!(
                matches!(EnvId::parse(id), Err(GymError::MalformedId(_))),
                "{id:?} should be malformed"
            );
        }
    }

    #[test]
    fn test_register_and_lookup() {
        let mut registry = EnvRegistry::new();
        registry.register(argument_spec("Test1-v0")).unwrap();
        assert_eq!(registry.spec("Test1-v0").unwrap().id.to_string(), "Test1-v0");
        assert_eq!(registry.list(), vec!["Test1-v0".to_string()]);
    }

    #[test]
    fn test_reregistration_is_rejected() {
        let mut registry = EnvRegistry::new();
        registry.register(argument_spec("Test1-v0")).unwrap();
        let err = registry.register(argument_spec("Test1-v0")).unwrap_err();
        assert!(matches!(err, GymError::Registration(_)));
    }

    #[test]
    fn test_versioned_unversioned_clash() {
        let mut registry = EnvRegistry::new();
        registry.register(argument_spec("Test/MyEnv-v0")).unwrap();
        let err = registry.register(argument_spec("Test/MyEnv")).unwrap_err();
        assert!(matches!(err, GymError::Registration(_)));

        let mut registry = EnvRegistry::new();
        registry.register(argument_spec("Test/MyEnv")).unwrap();
        let err = registry.register(argument_spec("Test/MyEnv-v0")).unwrap_err();
        assert!(matches!(err, GymError::Registration(_)));
    }

    #[test]
    fn test_version_resolution() {
        let mut registry = EnvRegistry::new();
        for version in [0, 9, 15] {
            registry.register(argument_spec(&format!("Test1-v{version}"))).unwrap();
        }

        // Above the newest version
        let err = registry.spec("Test1-v1000").unwrap_err();
        match err {
            GymError::VersionNotFound { known_versions, .. } => {
                assert_eq!(known_versions, "`v0`, `v9`, `v15`");
            }
            other => panic!("expected VersionNotFound, got {other}"),
        }

        // Below the newest, never registered
        let err = registry.spec("Test1-v1").unwrap_err();
        assert!(matches!(err, GymError::DeprecatedEnv(_)));
        assert!(err.to_string().contains("Test1-v15"));

        // Unversioned lookup resolves to the latest
        assert_eq!(registry.spec("Test1").unwrap().id.to_string(), "Test1-v15");
    }

    #[test]
    fn test_default_version_lookup() {
        let mut registry = EnvRegistry::new();
        registry.register(argument_spec("test/Test3")).unwrap();

        let err = registry.spec("test/Test3-v0").unwrap_err();
        assert!(matches!(err, GymError::DeprecatedEnv(_)));
        assert!(err.to_string().contains("provides the default version"));

        assert!(registry.spec("test/Test3").is_ok());
    }

    #[test]
    fn test_name_suggestions() {
        let registry = EnvRegistry::with_defaults();
        for (input, suggested) in [
            ("cartpole-v1", "CartPole"),
            ("pendalum-v1", "Pendulum"),
            ("mountaincarcontinuous-v0", "MountainCarContinuous"),
        ] {
            let err = registry.spec(input).unwrap_err();
            assert!(
                err.to_string().contains(&format!("Did you mean: `{suggested}`?")),
                "{input}: {err}"
            );
        }
    }

    #[test]
    fn test_namespace_suggestions() {
        let mut registry = EnvRegistry::new();
        registry
            .register(argument_spec("MyAwesomeNamespace/MyAwesomeEnv-v1"))
            .unwrap();

        let err = registry.spec("MyAwesomeNamspce/MyAwesomeEnv-v1").unwrap_err();
        assert!(err.to_string().contains("Did you mean: `MyAwesomeNamespace`?"));

        let err = registry.spec("MyAwesomeNamespace/MyAwesomeEnof-v1").unwrap_err();
        assert!(err.to_string().contains("Did you mean: `MyAwesomeEnv`?"));
    }

    #[test]
    fn test_namespace_scoping() {
        let mut registry = EnvRegistry::new();
        registry
            .with_namespace("MyDefaultNamespace", |r| {
                r.register(argument_spec("MyDefaultEnvironment-v0"))
            })
            .unwrap();
        registry.register(argument_spec("MyDefaultEnvironment-v1")).unwrap();

        assert!(registry.spec("MyDefaultNamespace/MyDefaultEnvironment-v0").is_ok());
        assert!(registry.spec("MyDefaultEnvironment-v1").is_ok());
    }

    #[test]
    fn test_missing_entry_point() {
        let mut registry = EnvRegistry::new();
        registry.register(EnvSpec::new("Empty-v0").unwrap()).unwrap();
        let Err(err) = registry.make("Empty-v0", EnvironmentConfig::default()) else {
            panic!("construction without an entry point should fail");
        };
        assert!(matches!(err, GymError::Registration(_)));
    }

    #[tokio::test]
    async fn test_make_attaches_spec_and_time_limit() {
        let registry = EnvRegistry::with_defaults();
        let mut env = registry
            .make("CartPole-v1", EnvironmentConfig::default())
            .unwrap();
        assert_eq!(env.spec_id(), Some("CartPole-v1"));

        // Order enforcement comes from make
        let err = env.step(&Sample::Discrete(0)).await.unwrap_err();
        assert!(matches!(err, GymError::ResetNeeded));

        env.reset(ResetOptions::with_seed(0)).await.unwrap();
        let mut steps = 0;
        loop {
            let step = env.step(&Sample::Discrete(steps % 2)).await.unwrap();
            steps += 1;
            if step.done {
                break;
            }
            assert!(steps <= 500, "time limit should have truncated");
        }
    }

    #[tokio::test]
    async fn test_make_with_kwargs_overrides_spec() {
        let mut registry = EnvRegistry::new();
        registry
            .register(
                EnvSpec::new("LowGravityPendulum-v0")
                    .unwrap()
                    .entry_point(|config| {
                        Ok(Box::new(PendulumEnv::new(config)?) as Box<dyn Environment>)
                    })
                    .kwarg("g", json!(1.62)),
            )
            .unwrap();

        // Spec default applies
        let mut env = registry
            .make("LowGravityPendulum-v0", EnvironmentConfig::default())
            .unwrap();
        env.reset(ResetOptions::with_seed(0)).await.unwrap();

        // Call-site override wins
        let mut config = EnvironmentConfig::default();
        config.params.insert("g".to_string(), json!(3.71));
        let mut env = registry.make("LowGravityPendulum-v0", config).unwrap();
        env.reset(ResetOptions::with_seed(0)).await.unwrap();
    }

    #[test]
    fn test_make_validates_render_mode() {
        let registry = EnvRegistry::with_defaults();

        let mut config = EnvironmentConfig::default();
        config.render_mode = Some("ansi".to_string());
        assert!(registry.make("CartPole-v1", config).is_ok());

        let mut config = EnvironmentConfig::default();
        config.render_mode = Some("None".to_string());
        assert!(registry.make("CartPole-v1", config).is_ok());

        let mut config = EnvironmentConfig::default();
        config.render_mode = Some("human".to_string());
        let Err(err) = registry.make("CartPole-v1", config) else {
            panic!("unsupported render mode should be rejected");
        };
        assert_eq!(
            err.to_string(),
            "Invalid render_mode provided: human. Valid render_modes: None, ansi"
        );
    }

    #[test]
    fn test_global_registry_roundtrip() {
        let id = "GlobalRegistryTest/Probe-v0";
        register_env(argument_spec(id)).unwrap();
        assert!(env_spec(id).is_ok());
        assert!(list_envs().contains(&id.to_string()));
        assert!(deregister_env(id).is_some());
        assert!(env_spec(id).is_err());
    }
}
