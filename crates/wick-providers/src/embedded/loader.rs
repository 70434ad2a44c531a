use super::device::select_device;
use crate::engine::{Availability, DeviceKind, EngineHandle, InferenceBackend};
use anyhow::Result;
use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};
use tracing::{debug, info, warn};

/// Model used when neither the request nor the configuration names one.
pub const FALLBACK_MODEL: &str = "TinyLlama/TinyLlama-1.1B-Chat-v1.0";

/// Pick the model id for a request: the requested id, else the configured
/// default, else [`FALLBACK_MODEL`].
pub fn resolve_model(requested: Option<&str>, configured_default: Option<&str>) -> String {
    requested
        .or(configured_default)
        .unwrap_or(FALLBACK_MODEL)
        .to_string()
}

type CacheKey = (String, DeviceKind);

/// One cache entry. Its mutex is held for the whole load, so concurrent
/// requests for the same key wait for a single load instead of racing.
type ModelSlot = Arc<Mutex<Option<Arc<dyn EngineHandle>>>>;

/// Resolves model ids and loads engine handles, caching them per
/// `(model_id, device)`.
pub struct ModelLoader {
    backend: Arc<dyn InferenceBackend>,
    availability: Availability,
    device_kind: DeviceKind,
    default_model: Option<String>,
    slots: Mutex<HashMap<CacheKey, ModelSlot>>,
}

impl ModelLoader {
    pub fn new(
        backend: Arc<dyn InferenceBackend>,
        device_kind: DeviceKind,
        default_model: Option<String>,
    ) -> Self {
        let availability = Availability::probe(backend.as_ref());
        Self {
            backend,
            availability,
            device_kind,
            default_model,
            slots: Mutex::new(HashMap::new()),
        }
    }

    pub fn availability(&self) -> &Availability {
        &self.availability
    }

    pub fn device_kind(&self) -> DeviceKind {
        self.device_kind
    }

    pub fn resolve(&self, requested: Option<&str>) -> String {
        resolve_model(requested, self.default_model.as_deref())
    }

    /// Return the loaded handle for `model_id`, loading it on first use.
    ///
    /// Engine construction errors are returned as-is and leave the slot
    /// empty, so a later request tries the load again. The same holds when
    /// a load panics.
    pub fn load(&self, model_id: &str) -> Result<Arc<dyn EngineHandle>> {
        self.availability.ensure()?;

        let slot = self.slot_for(model_id);
        if slot.is_poisoned() {
            warn!("Previous load of '{}' panicked, loading again", model_id);
        }
        let mut loaded = lock_recovering(&slot);

        if let Some(handle) = loaded.as_ref() {
            debug!("Reusing loaded model '{}' on {}", model_id, self.device_kind);
            return Ok(Arc::clone(handle));
        }

        let device = select_device(self.backend.as_ref(), &self.availability, self.device_kind)?;
        info!("Loading model '{}' on {}", model_id, self.device_kind);
        let handle = self.backend.from_pretrained(model_id, &device)?;
        debug!("Loaded '{}' (engine reports '{}')", model_id, handle.model_name());

        *loaded = Some(Arc::clone(&handle));
        Ok(handle)
    }

    /// Number of models currently held in the cache
    pub fn cached_models(&self) -> usize {
        lock_recovering(&self.slots)
            .values()
            .filter(|slot| lock_recovering(slot).is_some())
            .count()
    }

    fn slot_for(&self, model_id: &str) -> ModelSlot {
        let mut slots = lock_recovering(&self.slots);
        let slot = slots
            .entry((model_id.to_string(), self.device_kind))
            .or_insert_with(|| Arc::new(Mutex::new(None)));
        Arc::clone(slot)
    }
}

/// Lock a cache mutex even if a panicking holder poisoned it.
///
/// Slots are only written after a load succeeds, so a panic mid-load leaves
/// them empty and safe to reuse.
fn lock_recovering<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| {
        mutex.clear_poison();
        poisoned.into_inner()
    })
}
