//! Typed method registry
//!
//! Analytical methods implement [`AnalysisMethod`] and are registered under
//! a stable id with a factory closure. [`MethodRegistry::resolve`] builds
//! every instance once at startup; invocation goes through the calibration
//! gate before the method body runs.

use super::orchestrator::{CalibrationContext, CalibrationOrchestrator};
use crate::error::RegistryError;
use serde_json::Value;
use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::{debug, info};

/// One analytical capability
pub trait AnalysisMethod: Send + Sync {
    /// Stable id, matching the intrinsic calibration document
    fn method_id(&self) -> &str;

    /// Executors are fused with interaction terms over all eight layers
    fn is_executor(&self) -> bool {
        false
    }

    fn execute(&self, input: &Value) -> anyhow::Result<Value>;
}

type MethodFactory = Box<dyn Fn() -> Arc<dyn AnalysisMethod> + Send + Sync>;

#[derive(Default)]
pub struct MethodRegistry {
    factories: BTreeMap<String, MethodFactory>,
    instances: BTreeMap<String, Arc<dyn AnalysisMethod>>,
}

impl MethodRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register<F>(&mut self, method_id: &str, factory: F) -> Result<(), RegistryError>
    where
        F: Fn() -> Arc<dyn AnalysisMethod> + Send + Sync + 'static,
    {
        if self.factories.contains_key(method_id) {
            return Err(RegistryError::DuplicateMethod(method_id.to_string()));
        }
        self.factories.insert(method_id.to_string(), Box::new(factory));
        Ok(())
    }

    /// Instantiate every registered method
    pub fn resolve(&mut self) -> Result<usize, RegistryError> {
        for (id, factory) in &self.factories {
            if self.instances.contains_key(id) {
                continue;
            }
            let instance = factory();
            if instance.method_id() != id.as_str() {
                return Err(RegistryError::Execution {
                    method_id: id.clone(),
                    message: format!("factory produced method {}", instance.method_id()),
                });
            }
            self.instances.insert(id.clone(), instance);
        }
        info!(methods = self.instances.len(), "Method registry resolved");
        Ok(self.instances.len())
    }

    pub fn get(&self, method_id: &str) -> Option<Arc<dyn AnalysisMethod>> {
        self.instances.get(method_id).cloned()
    }

    pub fn method_ids(&self) -> impl Iterator<Item = &str> {
        self.factories.keys().map(String::as_str)
    }

    /// Calibrate then run the method
    pub fn invoke(
        &self,
        calibration: &CalibrationOrchestrator,
        method_id: &str,
        context: Option<&CalibrationContext>,
        input: &Value,
    ) -> Result<(f64, Value), RegistryError> {
        let method = self
            .get(method_id)
            .ok_or_else(|| RegistryError::UnknownMethod(method_id.to_string()))?;

        let score = calibration.calibrate(method_id, context, method.is_executor())?;
        debug!(method_id = %method_id, score, "Calibration gate passed");

        let output = method.execute(input).map_err(|e| RegistryError::Execution {
            method_id: method_id.to_string(),
            message: format!("{:#}", e),
        })?;
        Ok((score, output))
    }
}
