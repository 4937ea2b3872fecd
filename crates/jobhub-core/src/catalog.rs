//! Catálogo de workflows.
//!
//! Se construye una vez al arrancar y queda congelado: registrar dos
//! definiciones con la misma clave es un error fatal de arranque. El único
//! estado mutable es el índice `id persistido -> clave`, que se completa a
//! medida que el coordinador materializa las filas `WorkflowRecord`.

use std::sync::Arc;

use dashmap::DashMap;
use indexmap::IndexMap;
use log::debug;

use crate::errors::HubError;
use crate::workflow::WorkflowDefinition;

/// Identificador aceptado por `resolve`.
#[derive(Debug, Clone)]
pub enum WorkflowRef {
    Key(String),
    /// Id de la fila persistida del workflow.
    Id(i64),
    Definition(Arc<WorkflowDefinition>),
}

impl From<&str> for WorkflowRef {
    fn from(key: &str) -> Self {
        WorkflowRef::Key(key.to_string())
    }
}

impl From<String> for WorkflowRef {
    fn from(key: String) -> Self {
        WorkflowRef::Key(key)
    }
}

impl From<i64> for WorkflowRef {
    fn from(id: i64) -> Self {
        WorkflowRef::Id(id)
    }
}

impl From<Arc<WorkflowDefinition>> for WorkflowRef {
    fn from(def: Arc<WorkflowDefinition>) -> Self {
        WorkflowRef::Definition(def)
    }
}

impl std::fmt::Display for WorkflowRef {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            WorkflowRef::Key(k) => write!(f, "{k}"),
            WorkflowRef::Id(id) => write!(f, "#{id}"),
            WorkflowRef::Definition(d) => write!(f, "{}", d.key),
        }
    }
}

#[derive(Default)]
pub struct CatalogBuilder {
    defs: IndexMap<String, Arc<WorkflowDefinition>>,
}

impl CatalogBuilder {
    pub fn register(mut self, def: WorkflowDefinition) -> Result<Self, HubError> {
        if self.defs.contains_key(&def.key) {
            return Err(HubError::DuplicateWorkflowKey(def.key.clone()));
        }
        debug!("catalog:register key={} steps={}", def.key, def.len());
        self.defs.insert(def.key.clone(), Arc::new(def));
        Ok(self)
    }

    pub fn build(self) -> WorkflowCatalog {
        WorkflowCatalog { defs: self.defs,
                          ids: DashMap::new() }
    }
}

#[derive(Debug)]
pub struct WorkflowCatalog {
    defs: IndexMap<String, Arc<WorkflowDefinition>>,
    ids: DashMap<i64, String>,
}

impl WorkflowCatalog {
    pub fn builder() -> CatalogBuilder {
        CatalogBuilder::default()
    }

    /// Resuelve una definición. Con `strict=true` una referencia desconocida
    /// produce `WorkflowNotFound`; si no, `Ok(None)`.
    pub fn resolve(&self, r: &WorkflowRef, strict: bool) -> Result<Option<Arc<WorkflowDefinition>>, HubError> {
        let found = match r {
            WorkflowRef::Key(k) => self.defs.get(k).cloned(),
            WorkflowRef::Id(id) => self.ids.get(id).and_then(|k| self.defs.get(k.value()).cloned()),
            WorkflowRef::Definition(d) => self.defs.get(&d.key).cloned(),
        };
        match found {
            Some(d) => Ok(Some(d)),
            None if strict => Err(HubError::WorkflowNotFound(r.to_string())),
            None => Ok(None),
        }
    }

    pub fn get(&self, key: &str) -> Option<Arc<WorkflowDefinition>> {
        self.defs.get(key).cloned()
    }

    /// Asocia el id persistido de un workflow con su clave.
    pub fn bind_id(&self, id: i64, key: &str) {
        self.ids.insert(id, key.to_string());
    }

    pub fn key_for_id(&self, id: i64) -> Option<String> {
        self.ids.get(&id).map(|k| k.value().clone())
    }

    /// Definiciones en orden de registro; las internas sólo si se piden.
    pub fn list(&self, include_internal: bool) -> Vec<Arc<WorkflowDefinition>> {
        self.defs
            .values()
            .filter(|d| include_internal || !d.internal)
            .cloned()
            .collect()
    }

    pub fn keys(&self) -> impl Iterator<Item = &str> {
        self.defs.keys().map(|k| k.as_str())
    }

    pub fn len(&self) -> usize {
        self.defs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.defs.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::errors::StepError;
    use crate::workflow::{StepContext, Workflow, WorkflowDeps};
    use async_trait::async_trait;
    use serde_json::Value;

    struct Noop;

    #[async_trait]
    impl Workflow for Noop {
        async fn run_step(&mut self, _step: &str, _ctx: &mut StepContext) -> Result<Value, StepError> {
            Ok(Value::Null)
        }
    }

    fn def(key: &str, internal: bool) -> WorkflowDefinition {
        let b = WorkflowDefinition::builder(key).step(1, "only");
        let b = if internal { b.internal() } else { b };
        b.build(|_: &WorkflowDeps| Box::new(Noop) as Box<dyn Workflow>).unwrap()
    }

    #[test]
    fn duplicate_keys_fail_at_startup() {
        let res = WorkflowCatalog::builder().register(def("a", false))
                                            .and_then(|b| b.register(def("a", false)));
        assert!(matches!(res, Err(HubError::DuplicateWorkflowKey(k)) if k == "a"));
    }

    #[test]
    fn resolve_by_key_id_and_instance() {
        let cat = WorkflowCatalog::builder().register(def("a", false)).unwrap().build();
        let by_key = cat.resolve(&"a".into(), true).unwrap().unwrap();
        assert!(cat.resolve(&WorkflowRef::Id(7), false).unwrap().is_none());
        cat.bind_id(7, "a");
        let by_id = cat.resolve(&WorkflowRef::Id(7), true).unwrap().unwrap();
        let by_def = cat.resolve(&WorkflowRef::Definition(by_key.clone()), true).unwrap().unwrap();
        assert!(Arc::ptr_eq(&by_key, &by_id));
        assert!(Arc::ptr_eq(&by_key, &by_def));
    }

    #[test]
    fn strict_resolution_reports_not_found() {
        let cat = WorkflowCatalog::builder().build();
        assert!(matches!(cat.resolve(&"ghost".into(), true), Err(HubError::WorkflowNotFound(_))));
        assert!(cat.resolve(&"ghost".into(), false).unwrap().is_none());
    }

    #[test]
    fn internal_workflows_hidden_by_default() {
        let cat = WorkflowCatalog::builder().register(def("public", false))
                                            .unwrap()
                                            .register(def("system", true))
                                            .unwrap()
                                            .build();
        assert_eq!(cat.list(false).len(), 1);
        assert_eq!(cat.list(true).len(), 2);
    }
}
