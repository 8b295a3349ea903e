//! Batching of inference requests across many concurrent games.
//!
//! A [`ModelBatcher`] aggregates `run_many` calls from multiple
//! [`BatchingModel`] clients into larger (and therefore more efficient)
//! batched calls on the wrapped backend. Each batcher serves a single model;
//! there is no dedicated batching thread: the model call runs on whichever
//! client thread fires the batch, with the batcher's state lock released so
//! other clients can keep enqueuing.

use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Condvar, Mutex};

use log::info;

use crate::model::{FeatureDescriptor, InferenceBackend, ModelFactory, ModelInput, ModelOutput};

/// Per-request notification slot. `run_many` blocks on it until the batch
/// containing the request has been evaluated; exactly one waiter is
/// unblocked per request.
struct ResponseSlot {
    result: Mutex<Option<(Vec<ModelOutput>, String)>>,
    cv: Condvar,
}

/// A single inference request from a client, possibly containing multiple
/// individual inferences because of virtual losses.
struct InferenceRequest {
    /// In a two player game, the batcher used by the opponent.
    other_batcher: Option<Arc<ModelBatcher>>,
    inputs: Vec<ModelInput>,
    response: Arc<ResponseSlot>,
}

struct BatcherState {
    queue: std::collections::VecDeque<InferenceRequest>,
    /// Clients currently between `start_game` and `end_game`.
    num_active_clients: usize,
    num_batches: u64,
    num_inferences: u64,
}

/// Batches inference requests for a single model.
pub struct ModelBatcher {
    name: String,
    feature_descriptor: FeatureDescriptor,
    /// Controls double/triple buffering: the target batch size is
    /// `ceil(active_clients / buffer_count)`.
    buffer_count: usize,
    state: Mutex<BatcherState>,
    model: Mutex<Box<dyn InferenceBackend>>,
    /// Clients of this batcher playing a two player game and currently
    /// blocked waiting for the other player's move. They won't submit a
    /// request until it's their turn, so the batcher must not wait on them.
    num_waiting: AtomicUsize,
}

impl ModelBatcher {
    pub fn new(model: Box<dyn InferenceBackend>, buffer_count: usize) -> ModelBatcher {
        assert!(buffer_count >= 1);
        let name = model.name().to_string();
        let feature_descriptor = model.feature_descriptor();
        ModelBatcher {
            name,
            feature_descriptor,
            buffer_count,
            state: Mutex::new(BatcherState {
                queue: std::collections::VecDeque::new(),
                num_active_clients: 0,
                num_batches: 0,
                num_inferences: 0,
            }),
            model: Mutex::new(model),
            num_waiting: AtomicUsize::new(0),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn feature_descriptor(&self) -> FeatureDescriptor {
        self.feature_descriptor
    }

    pub fn start_game(&self) {
        let mut state = self.state.lock().unwrap();
        state.num_active_clients += 1;
    }

    pub fn end_game(&self) {
        {
            let mut state = self.state.lock().unwrap();
            state.num_active_clients -= 1;
        }
        // Fewer active clients may make a queued batch runnable.
        self.service_queue();
    }

    /// Enqueues a request, fires any runnable batches (on this thread), and
    /// blocks until the request has been evaluated.
    pub fn run_many(
        &self,
        other_batcher: Option<&Arc<ModelBatcher>>,
        inputs: Vec<ModelInput>,
    ) -> (Vec<ModelOutput>, String) {
        let response = Arc::new(ResponseSlot {
            result: Mutex::new(None),
            cv: Condvar::new(),
        });

        {
            let mut state = self.state.lock().unwrap();
            state.queue.push_back(InferenceRequest {
                other_batcher: other_batcher.cloned(),
                inputs,
                response: Arc::clone(&response),
            });
            if let Some(other) = other_batcher {
                other.num_waiting.fetch_add(1, Ordering::SeqCst);
            }
        }

        self.service_queue();
        if let Some(other) = other_batcher {
            other.service_queue();
        }

        let mut guard = response.result.lock().unwrap();
        while guard.is_none() {
            guard = response.cv.wait(guard).unwrap();
        }
        guard.take().unwrap()
    }

    fn target_batch_size(&self, state: &BatcherState) -> usize {
        state.num_active_clients.div_ceil(self.buffer_count).max(1)
    }

    /// Pops the next runnable batch, or `None` if the queue should keep
    /// filling. Must be called with the state lock held.
    fn pop_batch(&self, state: &mut BatcherState) -> Option<Vec<InferenceRequest>> {
        if state.queue.is_empty() {
            return None;
        }

        let batch_size = self.target_batch_size(state);
        let queue_size = state.queue.len();
        if queue_size < batch_size {
            // The queue doesn't have enough requests to fill a batch: run a
            // smaller batch only when every other active client has either
            // submitted a request or is waiting on a two player opponent,
            // and at least half the clients have submitted. The half
            // constraint forces clients into lock-step when games are still
            // starting up, keeping later batch sizes regular.
            let can_run_small_batch = queue_size >= state.num_active_clients / 2
                && queue_size + self.num_waiting.load(Ordering::SeqCst)
                    >= state.num_active_clients;
            if !can_run_small_batch {
                return None;
            }
        }

        let take = batch_size.min(state.queue.len());
        let batch: Vec<InferenceRequest> = state.queue.drain(..take).collect();
        state.num_batches += 1;
        state.num_inferences += batch.iter().map(|r| r.inputs.len() as u64).sum::<u64>();
        Some(batch)
    }

    /// Runs batches until the queue no longer holds a runnable one. The
    /// state lock is released while the model call runs and retaken to
    /// dequeue the next batch.
    fn service_queue(&self) {
        loop {
            let batch = {
                let mut state = self.state.lock().unwrap();
                self.pop_batch(&mut state)
            };
            let Some(batch) = batch else { return };

            let mut inputs = Vec::with_capacity(batch.len());
            for request in &batch {
                inputs.extend_from_slice(&request.inputs);
            }
            let mut outputs = vec![ModelOutput::default(); inputs.len()];
            let model_name = {
                let mut model = self.model.lock().unwrap();
                model.run_many(&inputs, &mut outputs)
            };

            let mut offset = 0;
            for request in batch {
                let n = request.inputs.len();
                let results = outputs[offset..offset + n].to_vec();
                offset += n;

                // For two player games, tell the opponent's batcher that it
                // isn't blocked on this inference any more.
                if let Some(other) = &request.other_batcher {
                    other.num_waiting.fetch_sub(1, Ordering::SeqCst);
                }

                *request.response.result.lock().unwrap() = Some((results, model_name.clone()));
                request.response.cv.notify_one();
            }
        }
    }

    /// (number of batches run, total inferences evaluated).
    pub fn stats(&self) -> (u64, u64) {
        let state = self.state.lock().unwrap();
        (state.num_batches, state.num_inferences)
    }
}

impl Drop for ModelBatcher {
    fn drop(&mut self) {
        let state = self.state.get_mut().unwrap();
        if state.num_batches > 0 {
            info!(
                "{}: ran {} batches with an average size of {:.1}",
                self.name,
                state.num_batches,
                state.num_inferences as f64 / state.num_batches as f64
            );
        }
    }
}

/// A thin client of a [`ModelBatcher`]. In two player games it also tracks
/// who the other player is, so its batcher knows whose turn it is.
pub struct BatchingModel {
    batcher: Arc<ModelBatcher>,
    other_batcher: Option<Arc<ModelBatcher>>,
}

impl BatchingModel {
    pub fn new(batcher: Arc<ModelBatcher>) -> BatchingModel {
        BatchingModel {
            batcher,
            other_batcher: None,
        }
    }

    pub fn start_game(&mut self) {
        self.batcher.start_game();
    }

    pub fn end_game(&mut self) {
        self.batcher.end_game();
    }

    fn set_other(&mut self, other: Option<&BatchingModel>) {
        match other {
            None => {
                assert!(self.other_batcher.is_some());
                self.other_batcher = None;
            }
            Some(other) => {
                assert!(self.other_batcher.is_none());
                self.other_batcher = Some(Arc::clone(&other.batcher));
            }
        }
    }
}

impl InferenceBackend for BatchingModel {
    fn name(&self) -> &str {
        self.batcher.name()
    }

    fn feature_descriptor(&self) -> FeatureDescriptor {
        self.batcher.feature_descriptor()
    }

    fn run_many(&mut self, inputs: &[ModelInput], outputs: &mut [ModelOutput]) -> String {
        assert_eq!(inputs.len(), outputs.len(), "batch size mismatch");
        let (results, model_name) = self
            .batcher
            .run_many(self.other_batcher.as_ref(), inputs.to_vec());
        for (out, result) in outputs.iter_mut().zip(results) {
            *out = result;
        }
        model_name
    }
}

/// Marks two clients as playing against each other so their batchers don't
/// deadlock waiting for the blocked player to submit.
pub fn start_two_player_game(black: &mut BatchingModel, white: &mut BatchingModel) {
    black.set_other(Some(white));
    white.set_other(Some(black));
    black.start_game();
    white.start_game();
}

pub fn end_two_player_game(black: &mut BatchingModel, white: &mut BatchingModel) {
    black.set_other(None);
    white.set_other(None);
    black.end_game();
    white.end_game();
}

/// Manages the per-model batchers and creates their [`BatchingModel`]
/// clients.
pub struct BatchingModelFactory {
    factory: Box<dyn ModelFactory>,
    buffer_count: usize,
    batchers: Mutex<HashMap<String, Arc<ModelBatcher>>>,
}

impl BatchingModelFactory {
    pub fn new(factory: Box<dyn ModelFactory>, buffer_count: usize) -> BatchingModelFactory {
        BatchingModelFactory {
            factory,
            buffer_count,
            batchers: Mutex::new(HashMap::new()),
        }
    }

    pub fn new_model(&self, path: &str) -> anyhow::Result<BatchingModel> {
        let mut batchers = self.batchers.lock().unwrap();

        let batcher = match batchers.get(path) {
            Some(batcher) => Arc::clone(batcher),
            None => {
                let model = self.factory.new_backend(path)?;
                let batcher = Arc::new(ModelBatcher::new(model, self.buffer_count));
                batchers.insert(path.to_string(), Arc::clone(&batcher));
                batcher
            }
        };

        // Take this opportunity to prune batchers that have no clients left.
        batchers.retain(|_, b| Arc::strong_count(b) > 1 || Arc::ptr_eq(b, &batcher));

        Ok(BatchingModel::new(batcher))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::color::Color;
    use crate::model::{FakeBackend, FakeModelFactory};
    use crate::position::Position;
    use crate::symmetry::Symmetry;

    fn test_input() -> ModelInput {
        ModelInput {
            sym: Symmetry::Identity,
            position_history: vec![Position::new(Color::Black)],
        }
    }

    #[test]
    fn test_single_client_fires_immediately() {
        let batcher = Arc::new(ModelBatcher::new(Box::new(FakeBackend::new("m")), 1));
        let mut model = BatchingModel::new(Arc::clone(&batcher));
        model.start_game();

        let inputs = vec![test_input(); 4];
        let mut outputs = vec![ModelOutput::default(); 4];
        let name = model.run_many(&inputs, &mut outputs);
        assert_eq!(name, "m");
        assert_eq!(batcher.stats(), (1, 4));

        model.end_game();
    }

    #[test]
    fn test_two_clients_share_a_batch() {
        let batcher = Arc::new(ModelBatcher::new(Box::new(FakeBackend::new("m")), 1));
        let mut a = BatchingModel::new(Arc::clone(&batcher));
        let mut b = BatchingModel::new(Arc::clone(&batcher));
        a.start_game();
        b.start_game();

        // With two active clients and buffer_count 1, the target batch size
        // is 2: each request waits for the other before the batch fires.
        let t = std::thread::spawn(move || {
            let inputs = vec![test_input()];
            let mut outputs = vec![ModelOutput::default()];
            b.run_many(&inputs, &mut outputs);
            b.end_game();
            b
        });

        let inputs = vec![test_input()];
        let mut outputs = vec![ModelOutput::default()];
        a.run_many(&inputs, &mut outputs);

        t.join().unwrap();
        a.end_game();
        let (batches, inferences) = batcher.stats();
        assert_eq!(batches, 1);
        assert_eq!(inferences, 2);
    }

    #[test]
    fn test_factory_reuses_batcher_per_path() {
        let factory = BatchingModelFactory::new(Box::new(FakeModelFactory::new()), 1);
        let a = factory.new_model("model-1").unwrap();
        let b = factory.new_model("model-1").unwrap();
        assert!(Arc::ptr_eq(&a.batcher, &b.batcher));
        let c = factory.new_model("model-2").unwrap();
        assert!(!Arc::ptr_eq(&a.batcher, &c.batcher));
    }
}
