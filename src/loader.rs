//! Module loading — turning discovered metadata into live instances.
//!
//! `ModuleLoader` is the seam products customize: the default
//! `FactoryLoader` maps implementation references to registered factory
//! functions, and the `instance_created` / `post_load` hooks let a
//! subclassing loader wrap or decorate instances around the activation
//! hook.

use std::collections::HashMap;
use std::sync::Arc;

use crate::boundary::IsolationBoundary;
use crate::context;
use crate::descriptor::MetaInfo;
use crate::error::{Error, Result};

/// Configuration passed to a module on activation.
pub type ModuleConfig = serde_json::Map<String, serde_json::Value>;

/// A live module instance.
///
/// `invoke` is the operation surface; the lifecycle hooks default to
/// no-ops so trivial modules only implement what they need.
pub trait ModuleInstance: Send {
    /// Activation hook, called once after construction with the module's
    /// configuration and discovery metadata.
    fn on_load(&mut self, _config: &ModuleConfig, _meta: &MetaInfo) -> anyhow::Result<()> {
        Ok(())
    }

    /// Deactivation hook, called once before the module is discarded.
    fn on_destroy(&mut self) -> anyhow::Result<()> {
        Ok(())
    }

    /// Executes one named operation.
    fn invoke(&mut self, operation: &str, payload: &serde_json::Value)
        -> anyhow::Result<serde_json::Value>;
}

/// Instantiates modules from metadata inside an isolation boundary.
pub trait ModuleLoader: Send + Sync {
    fn load(
        &self,
        meta: &MetaInfo,
        boundary: &Arc<IsolationBoundary>,
        config: &ModuleConfig,
    ) -> Result<Box<dyn ModuleInstance>>;

    /// Hook between construction and activation; may wrap the instance.
    fn instance_created(
        &self,
        instance: Box<dyn ModuleInstance>,
        _meta: &MetaInfo,
    ) -> anyhow::Result<Box<dyn ModuleInstance>> {
        Ok(instance)
    }

    /// Hook after successful activation; may wrap the instance.
    fn post_load(
        &self,
        instance: Box<dyn ModuleInstance>,
        _meta: &MetaInfo,
    ) -> anyhow::Result<Box<dyn ModuleInstance>> {
        Ok(instance)
    }
}

type Factory = Box<dyn Fn() -> Box<dyn ModuleInstance> + Send + Sync>;

/// Default loader: resolves a descriptor's implementation reference to a
/// factory function registered by the host.
#[derive(Default)]
pub struct FactoryLoader {
    factories: HashMap<String, Factory>,
}

impl FactoryLoader {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(
        &mut self,
        implementation: impl Into<String>,
        factory: impl Fn() -> Box<dyn ModuleInstance> + Send + Sync + 'static,
    ) {
        self.factories.insert(implementation.into(), Box::new(factory));
    }
}

impl ModuleLoader for FactoryLoader {
    fn load(
        &self,
        meta: &MetaInfo,
        boundary: &Arc<IsolationBoundary>,
        config: &ModuleConfig,
    ) -> Result<Box<dyn ModuleInstance>> {
        let fail = |cause: anyhow::Error| Error::LoadFailure {
            identity: meta.descriptor.versioned_identity(),
            location: meta.source_location.clone(),
            cause,
        };
        let factory = self
            .factories
            .get(&meta.descriptor.implementation)
            .ok_or_else(|| {
                fail(anyhow::anyhow!(
                    "no factory registered for implementation '{}'",
                    meta.descriptor.implementation
                ))
            })?;
        // construction and activation both run with the boundary ambient
        context::with_boundary(boundary, || {
            let instance = factory();
            let mut instance = self.instance_created(instance, meta).map_err(fail)?;
            instance.on_load(config, meta).map_err(fail)?;
            self.post_load(instance, meta).map_err(fail)
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::descriptor::parse_descriptors;

    struct Recording {
        loads: usize,
    }

    impl ModuleInstance for Recording {
        fn on_load(&mut self, config: &ModuleConfig, _meta: &MetaInfo) -> anyhow::Result<()> {
            if config.contains_key("fail") {
                anyhow::bail!("refused configuration");
            }
            self.loads += 1;
            Ok(())
        }

        fn invoke(
            &mut self,
            _operation: &str,
            _payload: &serde_json::Value,
        ) -> anyhow::Result<serde_json::Value> {
            Ok(serde_json::json!(self.loads))
        }
    }

    fn meta(implementation: &str) -> MetaInfo {
        let doc = format!(
            r#"{{"type": "t", "name": "n", "version": "1.0.0", "implementation": "{implementation}"}}"#
        );
        MetaInfo {
            descriptor: parse_descriptors(doc.as_bytes(), "file:///pkg")
                .unwrap()
                .remove(0),
            source_location: "file:///pkg".to_string(),
        }
    }

    #[test]
    fn loads_registered_implementation_and_activates_it() {
        let mut loader = FactoryLoader::new();
        loader.register("rec", || Box::new(Recording { loads: 0 }));
        let boundary = Arc::new(IsolationBoundary::new(Vec::new()));

        let mut instance = loader
            .load(&meta("rec"), &boundary, &ModuleConfig::new())
            .unwrap();
        let loads = instance.invoke("count", &serde_json::Value::Null).unwrap();
        assert_eq!(loads, serde_json::json!(1));
    }

    #[test]
    fn unregistered_implementation_is_a_load_failure() {
        let loader = FactoryLoader::new();
        let boundary = Arc::new(IsolationBoundary::new(Vec::new()));
        let err = loader
            .load(&meta("ghost"), &boundary, &ModuleConfig::new())
            .err()
            .unwrap();
        match err {
            Error::LoadFailure { identity, .. } => {
                assert_eq!(identity.to_string(), "t:n:1.0.0");
            }
            other => panic!("expected LoadFailure, got {other}"),
        }
    }

    #[test]
    fn activation_failure_is_a_load_failure() {
        let mut loader = FactoryLoader::new();
        loader.register("rec", || Box::new(Recording { loads: 0 }));
        let boundary = Arc::new(IsolationBoundary::new(Vec::new()));
        let mut config = ModuleConfig::new();
        config.insert("fail".to_string(), serde_json::json!(true));

        let err = loader.load(&meta("rec"), &boundary, &config).err().unwrap();
        assert!(matches!(err, Error::LoadFailure { .. }));
    }

    #[test]
    fn boundary_is_ambient_during_activation() {
        struct CheckAmbient;
        impl ModuleInstance for CheckAmbient {
            fn on_load(&mut self, _c: &ModuleConfig, _m: &MetaInfo) -> anyhow::Result<()> {
                if context::current_boundary().is_none() {
                    anyhow::bail!("no ambient boundary");
                }
                Ok(())
            }
            fn invoke(
                &mut self,
                _op: &str,
                _p: &serde_json::Value,
            ) -> anyhow::Result<serde_json::Value> {
                Ok(serde_json::Value::Null)
            }
        }

        let mut loader = FactoryLoader::new();
        loader.register("rec", || Box::new(CheckAmbient));
        let boundary = Arc::new(IsolationBoundary::new(Vec::new()));
        loader
            .load(&meta("rec"), &boundary, &ModuleConfig::new())
            .unwrap();
        assert!(context::current_boundary().is_none());
    }
}
