use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::{mpsc, Arc, Condvar, Mutex};
use std::thread;

use serde_json::{json, Value};

use bitz_contracts::events::EventWriter;
use bitz_contracts::species::SpeciesDataset;

use crate::extractor::SpeciesExtractor;

/// One scheduled classification run: extract species from a stored
/// image and append the rows to the quest's dataset.
#[derive(Debug, Clone)]
pub struct ClassificationJob {
    pub quest_id: String,
    pub image_path: PathBuf,
    pub coordinates: Option<Value>,
    pub language: String,
}

/// Bounded worker pool for background classification.
///
/// Jobs run detached from the request that scheduled them: failures
/// are emitted to the event log and swallowed, never retried
/// (at-most-once, best-effort). Extraction calls run concurrently
/// across quests; the dataset append is serialized per quest because
/// interleaved appends to one CSV can corrupt a row.
pub struct ClassificationWorker {
    sender: Option<mpsc::Sender<ClassificationJob>>,
    handles: Vec<thread::JoinHandle<()>>,
    pending: Arc<Pending>,
}

struct Pending {
    count: Mutex<usize>,
    idle: Condvar,
}

struct Shared {
    root: PathBuf,
    extractor: SpeciesExtractor,
    events: EventWriter,
    quest_locks: Mutex<HashMap<String, Arc<Mutex<()>>>>,
}

impl ClassificationWorker {
    pub fn new(
        root: impl Into<PathBuf>,
        extractor: SpeciesExtractor,
        events: EventWriter,
        workers: usize,
    ) -> Self {
        let (sender, receiver) = mpsc::channel::<ClassificationJob>();
        let receiver = Arc::new(Mutex::new(receiver));
        let shared = Arc::new(Shared {
            root: root.into(),
            extractor,
            events,
            quest_locks: Mutex::new(HashMap::new()),
        });
        let pending = Arc::new(Pending {
            count: Mutex::new(0),
            idle: Condvar::new(),
        });

        let mut handles = Vec::new();
        for _ in 0..workers.max(1) {
            let receiver = Arc::clone(&receiver);
            let shared = Arc::clone(&shared);
            let pending = Arc::clone(&pending);
            handles.push(thread::spawn(move || loop {
                let job = {
                    let Ok(guard) = receiver.lock() else {
                        break;
                    };
                    guard.recv()
                };
                let Ok(job) = job else {
                    break;
                };
                run_job(&shared, &job);
                pending.finish();
            }));
        }

        Self {
            sender: Some(sender),
            handles,
            pending,
        }
    }

    /// Queues a job and returns immediately. The caller never learns
    /// the outcome; the event log does.
    pub fn schedule(&self, job: ClassificationJob) {
        let Some(sender) = &self.sender else {
            return;
        };
        self.pending.start();
        if sender.send(job).is_err() {
            self.pending.finish();
        }
    }

    /// Blocks until every scheduled job has completed. Host processes
    /// that own the pool call this before exit; a long-running server
    /// never needs to.
    pub fn wait_idle(&self) {
        let Ok(mut count) = self.pending.count.lock() else {
            return;
        };
        while *count > 0 {
            count = match self.pending.idle.wait(count) {
                Ok(guard) => guard,
                Err(_) => return,
            };
        }
    }
}

impl Drop for ClassificationWorker {
    fn drop(&mut self) {
        self.sender.take();
        for handle in self.handles.drain(..) {
            let _ = handle.join();
        }
    }
}

impl Pending {
    fn start(&self) {
        if let Ok(mut count) = self.count.lock() {
            *count += 1;
        }
    }

    fn finish(&self) {
        if let Ok(mut count) = self.count.lock() {
            *count = count.saturating_sub(1);
            if *count == 0 {
                self.idle.notify_all();
            }
        }
    }
}

fn run_job(shared: &Shared, job: &ClassificationJob) {
    let mut records = match shared.extractor.extract(&job.image_path, &job.language) {
        Ok(records) => records,
        Err(err) => {
            let _ = shared.events.emit_for_quest(
                "classification_failed",
                &job.quest_id,
                payload(json!({
                    "image": job.image_path.to_string_lossy().to_string(),
                    "error": format!("{err:#}"),
                })),
            );
            return;
        }
    };

    let (latitude, longitude) = coordinate_fields(job.coordinates.as_ref());
    for record in &mut records {
        record.latitude = latitude.clone();
        record.longitude = longitude.clone();
    }

    let lock = shared.quest_lock(&job.quest_id);
    let _guard = lock.lock();
    let dataset = SpeciesDataset::for_quest(&shared.root, &job.quest_id);
    match dataset.append(&records) {
        Ok(()) => {
            let _ = shared.events.emit_for_quest(
                "classification_done",
                &job.quest_id,
                payload(json!({
                    "image": job.image_path.to_string_lossy().to_string(),
                    "rows": records.len(),
                })),
            );
        }
        Err(err) => {
            let _ = shared.events.emit_for_quest(
                "classification_failed",
                &job.quest_id,
                payload(json!({
                    "image": job.image_path.to_string_lossy().to_string(),
                    "error": err.to_string(),
                })),
            );
        }
    }
}

impl Shared {
    fn quest_lock(&self, quest_id: &str) -> Arc<Mutex<()>> {
        let Ok(mut locks) = self.quest_locks.lock() else {
            return Arc::new(Mutex::new(()));
        };
        Arc::clone(
            locks
                .entry(quest_id.to_string())
                .or_insert_with(|| Arc::new(Mutex::new(()))),
        )
    }
}

fn payload(value: Value) -> bitz_contracts::events::EventPayload {
    value.as_object().cloned().unwrap_or_default()
}

/// Coordinates arrive as whatever the client sent: an object with
/// latitude/longitude keys or a two-element array. Anything else maps
/// to empty fields.
fn coordinate_fields(coordinates: Option<&Value>) -> (String, String) {
    let Some(coordinates) = coordinates else {
        return (String::new(), String::new());
    };
    let as_text = |value: &Value| match value {
        Value::String(text) => text.trim().to_string(),
        Value::Number(number) => number.to_string(),
        _ => String::new(),
    };
    match coordinates {
        Value::Object(obj) => (
            obj.get("latitude").map(&as_text).unwrap_or_default(),
            obj.get("longitude").map(&as_text).unwrap_or_default(),
        ),
        Value::Array(items) if items.len() == 2 => (as_text(&items[0]), as_text(&items[1])),
        _ => (String::new(), String::new()),
    }
}
