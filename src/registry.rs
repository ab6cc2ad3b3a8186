//! Explicit registration of the models an observer may intercept.
//!
//! Models are registered in a [`ModelRegistry`] and called through the returned
//! [`ModelHandle`]. Each handle owns a small entry-point table, one occupant per
//! [`EntryPoint`]; activating an observer swaps occupants for recording
//! wrappers and keeps a [`PatchRecord`] per swap so the table can be put back.
//!
//! The registry only holds weak references: a model whose handles are all
//! dropped is no longer a target.

use std::sync::{Arc, Mutex, PoisonError, RwLock, Weak};

use async_trait::async_trait;
use once_cell::sync::Lazy;
use tower::BoxError;
use tracing::debug;

use crate::error::{RecordError, RestoreFailure};
use crate::model::{EntryPoint, GenerateRequest, LanguageModel, LlmResult};

static GLOBAL: Lazy<ModelRegistry> = Lazy::new(ModelRegistry::new);

/// Compare two trait objects by the address of the value they point at.
pub(crate) fn same_model(a: &Arc<dyn LanguageModel>, b: &Arc<dyn LanguageModel>) -> bool {
    std::ptr::eq(Arc::as_ptr(a) as *const (), Arc::as_ptr(b) as *const ())
}

struct EntryTable {
    generate: Arc<dyn LanguageModel>,
    agenerate: Arc<dyn LanguageModel>,
}

impl EntryTable {
    fn get(&self, entry_point: EntryPoint) -> &Arc<dyn LanguageModel> {
        match entry_point {
            EntryPoint::Generate => &self.generate,
            EntryPoint::AGenerate => &self.agenerate,
        }
    }

    fn get_mut(&mut self, entry_point: EntryPoint) -> &mut Arc<dyn LanguageModel> {
        match entry_point {
            EntryPoint::Generate => &mut self.generate,
            EntryPoint::AGenerate => &mut self.agenerate,
        }
    }
}

struct ModelSlot {
    endpoint: String,
    entries: RwLock<EntryTable>,
    sealed: std::sync::atomic::AtomicBool,
}

/// Shared handle to a model's entry points.
///
/// Calls go to whatever currently occupies the entry point, so a handle
/// obtained before an observer was activated is intercepted too.
#[derive(Clone)]
pub struct ModelHandle {
    slot: Arc<ModelSlot>,
}

impl ModelHandle {
    /// Wrap a model in a handle without registering it anywhere.
    pub fn new(model: impl LanguageModel) -> Self {
        Self::from_arc(Arc::new(model))
    }

    pub fn from_arc(model: Arc<dyn LanguageModel>) -> Self {
        let endpoint = model.endpoint();
        Self {
            slot: Arc::new(ModelSlot {
                endpoint,
                entries: RwLock::new(EntryTable {
                    generate: model.clone(),
                    agenerate: model,
                }),
                sealed: std::sync::atomic::AtomicBool::new(false),
            }),
        }
    }

    /// Endpoint identifier of the underlying model.
    pub fn endpoint(&self) -> &str {
        &self.slot.endpoint
    }

    /// Current occupant of `entry_point`.
    pub fn entry(&self, entry_point: EntryPoint) -> Arc<dyn LanguageModel> {
        self.slot
            .entries
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(entry_point)
            .clone()
    }

    /// Refuse any further substitution of this handle's entry points.
    pub fn seal(&self) {
        self.slot
            .sealed
            .store(true, std::sync::atomic::Ordering::SeqCst);
    }

    pub fn is_sealed(&self) -> bool {
        self.slot.sealed.load(std::sync::atomic::Ordering::SeqCst)
    }

    /// Whether both handles point at the same entry-point table.
    pub fn same_handle(&self, other: &ModelHandle) -> bool {
        Arc::ptr_eq(&self.slot, &other.slot)
    }
}

impl std::fmt::Debug for ModelHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ModelHandle")
            .field("endpoint", &self.slot.endpoint)
            .field("sealed", &self.is_sealed())
            .finish()
    }
}

#[async_trait]
impl LanguageModel for ModelHandle {
    fn generate(&self, request: GenerateRequest) -> Result<LlmResult, BoxError> {
        self.entry(EntryPoint::Generate).generate(request)
    }

    async fn agenerate(&self, request: GenerateRequest) -> Result<LlmResult, BoxError> {
        // the lock must not be held across the await
        let model = self.entry(EntryPoint::AGenerate);
        model.agenerate(request).await
    }

    fn endpoint(&self) -> String {
        self.slot.endpoint.clone()
    }
}

/// One substituted entry point and how to undo the substitution.
pub struct PatchRecord {
    handle: ModelHandle,
    entry_point: EntryPoint,
    original: Arc<dyn LanguageModel>,
    installed: Arc<dyn LanguageModel>,
}

impl PatchRecord {
    /// Replace the occupant of `entry_point` with `wrap(original)`.
    pub(crate) fn apply<F>(
        handle: &ModelHandle,
        entry_point: EntryPoint,
        wrap: F,
    ) -> Result<PatchRecord, RecordError>
    where
        F: FnOnce(Arc<dyn LanguageModel>) -> Arc<dyn LanguageModel>,
    {
        if handle.is_sealed() {
            return Err(RecordError::PatchFailed {
                endpoint: handle.endpoint().to_string(),
                entry_point,
                reason: "handle is sealed".to_string(),
            });
        }
        let mut entries = handle
            .slot
            .entries
            .write()
            .unwrap_or_else(PoisonError::into_inner);
        let slot = entries.get_mut(entry_point);
        let original = slot.clone();
        let installed = wrap(original.clone());
        *slot = installed.clone();
        debug!(endpoint = %handle.endpoint(), entry_point = %entry_point, "Patched entry point");
        Ok(PatchRecord {
            handle: handle.clone(),
            entry_point,
            original,
            installed,
        })
    }

    /// Put the original occupant back.
    ///
    /// Only succeeds while the entry point still holds the wrapper this record
    /// installed; anything else was put there by someone else and is left alone.
    pub fn restore(self) -> Result<(), RestoreFailure> {
        let mut entries = self
            .handle
            .slot
            .entries
            .write()
            .unwrap_or_else(PoisonError::into_inner);
        let slot = entries.get_mut(self.entry_point);
        if !same_model(slot, &self.installed) {
            return Err(RestoreFailure {
                endpoint: self.handle.endpoint().to_string(),
                entry_point: self.entry_point,
                reason: "entry point no longer holds the recording wrapper".to_string(),
            });
        }
        *slot = self.original;
        debug!(endpoint = %self.handle.endpoint(), entry_point = %self.entry_point, "Restored entry point");
        Ok(())
    }

    pub fn endpoint(&self) -> &str {
        self.handle.endpoint()
    }

    pub fn entry_point(&self) -> EntryPoint {
        self.entry_point
    }
}

impl std::fmt::Debug for PatchRecord {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PatchRecord")
            .field("endpoint", &self.handle.endpoint())
            .field("entry_point", &self.entry_point)
            .finish_non_exhaustive()
    }
}

/// The set of models eligible for interception.
#[derive(Default)]
pub struct ModelRegistry {
    slots: Mutex<Vec<Weak<ModelSlot>>>,
}

impl ModelRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Process-wide registry.
    pub fn global() -> &'static ModelRegistry {
        &GLOBAL
    }

    /// Register a model and return the handle to call it through.
    pub fn register(&self, model: impl LanguageModel) -> ModelHandle {
        let handle = ModelHandle::new(model);
        self.add(&handle);
        handle
    }

    /// Register an existing handle. Registering the same handle twice is a no-op.
    pub fn add(&self, handle: &ModelHandle) {
        let mut slots = self.slots.lock().unwrap_or_else(PoisonError::into_inner);
        let known = slots
            .iter()
            .filter_map(Weak::upgrade)
            .any(|slot| Arc::ptr_eq(&slot, &handle.slot));
        if !known {
            debug!(endpoint = %handle.endpoint(), "Registered model");
            slots.push(Arc::downgrade(&handle.slot));
        }
    }

    /// Snapshot of the models that are still alive, in registration order.
    pub fn live(&self) -> Vec<ModelHandle> {
        let mut slots = self.slots.lock().unwrap_or_else(PoisonError::into_inner);
        slots.retain(|slot| slot.strong_count() > 0);
        slots
            .iter()
            .filter_map(Weak::upgrade)
            .map(|slot| ModelHandle { slot })
            .collect()
    }

    pub fn len(&self) -> usize {
        self.live().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Echo;

    #[async_trait]
    impl LanguageModel for Echo {
        fn generate(&self, _request: GenerateRequest) -> Result<LlmResult, BoxError> {
            Ok(LlmResult::default())
        }

        async fn agenerate(&self, request: GenerateRequest) -> Result<LlmResult, BoxError> {
            self.generate(request)
        }

        fn endpoint(&self) -> String {
            "echo".to_string()
        }
    }

    struct Other;

    #[async_trait]
    impl LanguageModel for Other {
        fn generate(&self, _request: GenerateRequest) -> Result<LlmResult, BoxError> {
            Err("other".into())
        }

        async fn agenerate(&self, _request: GenerateRequest) -> Result<LlmResult, BoxError> {
            Err("other".into())
        }
    }

    #[test]
    fn registry_drops_dead_models() {
        let registry = ModelRegistry::new();
        let kept = registry.register(Echo);
        {
            let _gone = registry.register(Echo);
            assert_eq!(registry.len(), 2);
        }
        let live = registry.live();
        assert_eq!(live.len(), 1);
        assert!(live[0].same_handle(&kept));
    }

    #[test]
    fn registering_twice_is_noop() {
        let registry = ModelRegistry::new();
        let handle = registry.register(Echo);
        registry.add(&handle);
        registry.add(&handle.clone());
        assert_eq!(registry.len(), 1);
    }

    #[test]
    fn patch_and_restore_round_trip() {
        let handle = ModelHandle::new(Echo);
        let before = handle.entry(EntryPoint::Generate);
        let replacement: Arc<dyn LanguageModel> = Arc::new(Other);

        let record = PatchRecord::apply(&handle, EntryPoint::Generate, |_| replacement.clone())
            .unwrap();
        assert!(same_model(&handle.entry(EntryPoint::Generate), &replacement));
        assert!(handle.generate(GenerateRequest::new("x")).is_err());
        // the other entry point is untouched
        assert!(same_model(&handle.entry(EntryPoint::AGenerate), &before));

        record.restore().unwrap();
        assert!(same_model(&handle.entry(EntryPoint::Generate), &before));
        assert!(handle.generate(GenerateRequest::new("x")).is_ok());
    }

    #[test]
    fn restore_leaves_foreign_substitutions_alone() {
        let handle = ModelHandle::new(Echo);
        let record =
            PatchRecord::apply(&handle, EntryPoint::Generate, |_| Arc::new(Other)).unwrap();
        let foreign =
            PatchRecord::apply(&handle, EntryPoint::Generate, |_| Arc::new(Echo)).unwrap();

        let err = record.restore().unwrap_err();
        assert_eq!(err.entry_point, EntryPoint::Generate);
        assert_eq!(err.endpoint, "echo");

        let foreign_occupant = foreign.installed.clone();
        assert!(same_model(&handle.entry(EntryPoint::Generate), &foreign_occupant));
    }

    #[test]
    fn sealed_handles_refuse_patching() {
        let handle = ModelHandle::new(Echo);
        handle.seal();
        let err = PatchRecord::apply(&handle, EntryPoint::AGenerate, |m| m).unwrap_err();
        assert!(matches!(
            err,
            RecordError::PatchFailed { entry_point: EntryPoint::AGenerate, .. }
        ));
    }

    #[test]
    fn default_endpoint_is_module_path() {
        let handle = ModelHandle::new(Other);
        assert_eq!(handle.endpoint(), "tower_llm_record::registry::tests");
    }

    #[tokio::test]
    async fn handle_dispatches_async_entry_point() {
        let handle = ModelHandle::new(Echo);
        assert_eq!(
            handle.agenerate(GenerateRequest::new("x")).await.unwrap(),
            LlmResult::default()
        );
    }
}
