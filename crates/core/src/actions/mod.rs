//! Engine-step actions: prefill and decode batch mechanics, the post-step
//! reconciler, preemption, and the abort hook.
//!
//! The scheduler drives one batch action per engine step and then runs
//! `step_post_process` over the requests that participated. All functions
//! here execute synchronously on the engine thread.

mod abort;
mod decode;
mod postproc;
mod preempt;
mod prefill;

pub use abort::abort_request;
pub use decode::decode_step;
pub use postproc::step_post_process;
pub use preempt::preempt_last_running_entry;
pub use prefill::prefill_step;

use crate::engine_state::EngineState;
use crate::model::ModelHandle;

pub(crate) fn remove_sequence_from_models(models: &mut [Box<dyn ModelHandle>], seq_id: i64) {
    for model in models.iter_mut() {
        model.remove_sequence(seq_id);
    }
}

/// Release one retiring sequence.
///
/// A cache-resident sequence is recycled lazily so its contents can seed
/// future prompts, unless the request pinned it, in which case both the
/// cache entry and the KV slots stay put. A sequence the cache does not know
/// is removed from every model directly. Any ids the cache gives back (the
/// sequence itself on eager recycling, or LRU victims evicted under
/// capacity pressure) are freed the same way.
pub(crate) fn release_sequence(
    estate: &mut EngineState,
    models: &mut [Box<dyn ModelHandle>],
    seq_id: i64,
    pinned: bool,
) {
    if estate.prefix_cache.has_sequence(seq_id) {
        if pinned {
            return;
        }
        for freed in estate.prefix_cache.recycle_sequence(seq_id, true) {
            remove_sequence_from_models(models, freed);
            estate.id_manager.recycle(freed);
        }
    } else {
        remove_sequence_from_models(models, seq_id);
        estate.id_manager.recycle(seq_id);
    }
}
