use std::{
    collections::{BTreeMap, VecDeque},
    fmt, io,
    num::NonZeroUsize,
    panic::{self, AssertUnwindSafe},
    sync::{mpsc, Arc, Mutex, PoisonError},
    thread::{self, JoinHandle},
    time::{Duration, Instant},
};

use log::{debug, error, info};
use serde::Serialize;

use crate::builder::{Builder, Generated};

/// Fewer workers than this starve a layer behind a single slow image.
pub const MIN_WORKERS: usize = 2;
/// More concurrent builds than this contend for the build tool's storage locks.
pub const MAX_WORKERS: usize = 8;

/// Number of worker threads for a layer of `layer_len` images on a machine with `cores` cores.
pub fn worker_count(layer_len: usize, cores: usize) -> usize {
    layer_len.min(cores.clamp(MIN_WORKERS, MAX_WORKERS))
}

pub fn available_cores() -> usize {
    thread::available_parallelism().map_or(1, NonZeroUsize::get)
}

/// A point in time, or `None` when it lies too far out to represent and is never reached.
pub struct Deadline(Option<Instant>);

impl Deadline {
    /// Create a new deadline that times out after the provided duration.
    pub fn after(timeout: Duration) -> Self {
        Self(Instant::now().checked_add(timeout))
    }

    /// The time left, or `None` once the deadline has passed.
    pub fn remaining(&self) -> Option<Duration> {
        match self.0 {
            Some(deadline) => deadline
                .checked_duration_since(Instant::now())
                .filter(|remaining| !remaining.is_zero()),
            None => Some(Duration::MAX),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ImageReport {
    pub name: String,
    pub generated: Generated,
}

/// Runs the images of one layer concurrently.
pub struct LayerExecutor {
    builder: Arc<dyn Builder>,
    timeout: Duration,
    cores: usize,
}

type TaskResult = crate::Result<Generated>;

impl LayerExecutor {
    pub fn new(builder: Arc<dyn Builder>, timeout: Duration) -> Self {
        Self {
            builder,
            timeout,
            cores: available_cores(),
        }
    }

    pub fn with_cores(mut self, cores: usize) -> Self {
        self.cores = cores;
        self
    }

    /// Generates every image in the layer and waits until all of them finish, one of them fails, or the timeout
    /// expires. After a failure the images that are still running are allowed to finish before this returns. After a
    /// timeout, the images still running are left behind.
    pub fn run(&self, layer: &[String]) -> Result<Vec<ImageReport>, LayerError> {
        if layer.is_empty() {
            return Ok(Vec::new());
        }

        let workers = worker_count(layer.len(), self.cores);
        debug!("running {} images on {workers} workers", layer.len());

        let queue = Arc::new(Mutex::new(
            layer.iter().cloned().enumerate().collect::<VecDeque<_>>(),
        ));
        let (sender, receiver) = mpsc::channel::<(usize, TaskResult)>();

        let handles = start_workers(&queue, workers, |worker| {
            let queue = Arc::clone(&queue);
            let sender = sender.clone();
            let builder = Arc::clone(&self.builder);
            thread::Builder::new()
                .name(format!("layer-worker-{worker}"))
                .spawn(move || work(&queue, &sender, builder.as_ref()))
        })
        .map_err(LayerError::Spawn)?;
        drop(sender);

        let deadline = Deadline::after(self.timeout);
        let mut outcomes: Vec<Option<TaskResult>> = layer.iter().map(|_| None).collect();
        let mut done = 0;
        let mut failed = false;
        while done < layer.len() && !failed {
            let Some(remaining) = deadline.remaining() else {
                break;
            };
            match receiver.recv_timeout(remaining) {
                Ok((index, result)) => {
                    log_result(&layer[index], &result);
                    failed = result.is_err();
                    outcomes[index] = Some(result);
                    done += 1;
                }
                Err(mpsc::RecvTimeoutError::Timeout) => break,
                Err(mpsc::RecvTimeoutError::Disconnected) => break,
            }
        }

        if failed {
            debug!("waiting for the rest of the layer to finish after a failure");
            for handle in handles {
                // Workers catch builder panics, so joining can not fail.
                let _ = handle.join();
            }
        }

        // Results that arrived after the wait returned belong to tasks that were not done at that point.
        let late = receiver.try_iter().collect::<BTreeMap<_, _>>();
        for (&index, result) in &late {
            log_result(&layer[index], result);
        }

        classify(layer, outcomes, late, self.timeout)
    }
}

type Queue = Mutex<VecDeque<(usize, String)>>;

/// Starts `workers` threads with `spawn`. The queue stays locked until all of them are running and is emptied when
/// one fails to start, so nothing gets built for a layer that already reported an error.
fn start_workers<S>(queue: &Queue, workers: usize, mut spawn: S) -> io::Result<Vec<JoinHandle<()>>>
where
    S: FnMut(usize) -> io::Result<JoinHandle<()>>,
{
    let mut pending = queue.lock().unwrap_or_else(PoisonError::into_inner);
    let handles = (0..workers).map(&mut spawn).collect::<io::Result<Vec<_>>>();
    if handles.is_err() {
        pending.clear();
    }
    handles
}

fn work(queue: &Queue, sender: &mpsc::Sender<(usize, TaskResult)>, builder: &dyn Builder) {
    loop {
        let next = queue
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .pop_front();
        let Some((index, name)) = next else {
            break;
        };
        let result = panic::catch_unwind(AssertUnwindSafe(|| builder.generate(&name)))
            .unwrap_or_else(|_| Err(format!("generating image {name:?} panicked").into()));
        if sender.send((index, result)).is_err() {
            break;
        }
    }
}

fn log_result(name: &str, result: &TaskResult) {
    match result {
        Ok(generated) => info!("{name}: {generated}"),
        Err(error) => error!("{name}: {error}"),
    }
}

fn classify(
    layer: &[String],
    outcomes: Vec<Option<TaskResult>>,
    mut late: BTreeMap<usize, TaskResult>,
    timeout: Duration,
) -> Result<Vec<ImageReport>, LayerError> {
    let mut reports = Vec::new();
    let mut failures = Vec::new();
    let mut pending = Vec::new();

    for (index, (name, outcome)) in layer.iter().zip(outcomes).enumerate() {
        let name = name.clone();
        match outcome {
            Some(Ok(generated)) => reports.push(ImageReport { name, generated }),
            Some(Err(error)) => failures.push(Failure { name, error }),
            None => pending.push(Pending {
                name,
                error: late.remove(&index).and_then(Result::err),
            }),
        }
    }

    if !failures.is_empty() {
        return Err(LayerError::Failed { failures, pending });
    }
    if !pending.is_empty() {
        return Err(LayerError::Incomplete { pending, timeout });
    }
    Ok(reports)
}

#[derive(Debug)]
pub struct Failure {
    pub name: String,
    pub error: crate::Error,
}

/// An image that had not finished when the layer stopped waiting.
#[derive(Debug)]
pub struct Pending {
    pub name: String,
    /// Set when the image failed after the layer stopped waiting.
    pub error: Option<crate::Error>,
}

#[derive(Debug)]
pub enum LayerError {
    /// At least one image finished with an error.
    Failed {
        failures: Vec<Failure>,
        pending: Vec<Pending>,
    },
    /// The timeout expired before every image finished.
    Incomplete {
        pending: Vec<Pending>,
        timeout: Duration,
    },
    Spawn(io::Error),
}

impl LayerError {
    /// Names of the images that failed or did not finish.
    pub fn images(&self) -> Vec<&str> {
        match self {
            LayerError::Failed { failures, pending } => failures
                .iter()
                .map(|failure| failure.name.as_str())
                .chain(pending.iter().map(|pending| pending.name.as_str()))
                .collect(),
            LayerError::Incomplete { pending, .. } => {
                pending.iter().map(|pending| pending.name.as_str()).collect()
            }
            LayerError::Spawn(_) => Vec::new(),
        }
    }
}

fn fmt_pending(f: &mut fmt::Formatter<'_>, pending: &[Pending]) -> fmt::Result {
    let names = pending
        .iter()
        .map(|pending| pending.name.as_str())
        .collect::<Vec<_>>();
    write!(f, "the following jobs were incomplete: {}", names.join(", "))?;
    for pending in pending {
        if let Some(error) = &pending.error {
            write!(f, "\n  {} raised the following error: {error}", pending.name)?;
        }
    }
    Ok(())
}

impl fmt::Display for LayerError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LayerError::Failed { failures, pending } => {
                f.write_str("the following errors were detected during container builds:")?;
                for failure in failures {
                    write!(f, "\n  {}: {}", failure.name, failure.error)?;
                }
                if !pending.is_empty() {
                    f.write_str("\n")?;
                    fmt_pending(f, pending)?;
                }
                Ok(())
            }
            LayerError::Incomplete { pending, timeout } => {
                write!(f, "layer did not finish within {timeout:?}, ")?;
                fmt_pending(f, pending)
            }
            LayerError::Spawn(error) => write!(f, "failed to start worker thread: {error}"),
        }
    }
}

impl std::error::Error for LayerError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            LayerError::Failed { failures, .. } => failures
                .first()
                .map(|failure| failure.error.as_ref() as &(dyn std::error::Error + 'static)),
            LayerError::Incomplete { .. } => None,
            LayerError::Spawn(error) => Some(error),
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::{
        atomic::{AtomicUsize, Ordering},
        Condvar,
    };

    use super::*;
    use crate::testing::FnBuilder;

    fn names(names: &[&str]) -> Vec<String> {
        names.iter().map(|name| name.to_string()).collect()
    }

    fn executor(builder: Arc<dyn Builder>) -> LayerExecutor {
        LayerExecutor::new(builder, Duration::from_secs(30)).with_cores(4)
    }

    #[test]
    fn test_worker_count() {
        assert_eq!(worker_count(3, 4), 3);
        assert_eq!(worker_count(1, 1), 1);
        assert_eq!(worker_count(10, 1), 2);
        assert_eq!(worker_count(10, 6), 6);
        assert_eq!(worker_count(100, 64), 8);
    }

    #[test]
    fn test_all_succeed() {
        let builder = FnBuilder::new(|_| Ok(Generated::BuiltAndPushed));
        let reports = executor(builder.clone()).run(&names(&["x", "y", "z"])).unwrap();
        assert_eq!(
            reports
                .iter()
                .map(|report| report.name.as_str())
                .collect::<Vec<_>>(),
            ["x", "y", "z"]
        );
        assert!(reports
            .iter()
            .all(|report| report.generated == Generated::BuiltAndPushed));
        let mut started = builder.started();
        started.sort();
        assert_eq!(started, ["x", "y", "z"]);
    }

    #[test]
    fn test_empty_layer() {
        let builder = FnBuilder::new(|_| Ok(Generated::Built));
        assert!(executor(builder.clone()).run(&[]).unwrap().is_empty());
        assert!(builder.started().is_empty());
    }

    #[test]
    fn test_fan_out_runs_concurrently() {
        // Every task waits until all three have started. With fewer than three workers the first task would give up
        // waiting and report how many had started.
        let started = Arc::new((Mutex::new(0), Condvar::new()));
        let builder = FnBuilder::new({
            let started = Arc::clone(&started);
            move |_| {
                let (count, condvar) = &*started;
                let mut count = count.lock().unwrap();
                *count += 1;
                condvar.notify_all();
                let (count, _) = condvar
                    .wait_timeout_while(count, Duration::from_secs(5), |count| *count < 3)
                    .unwrap();
                if *count == 3 {
                    Ok(Generated::Built)
                } else {
                    Err(format!("only {} tasks started", *count).into())
                }
            }
        });
        let reports = executor(builder).run(&names(&["x", "y", "z"])).unwrap();
        assert_eq!(reports.len(), 3);
    }

    #[test]
    fn test_failure_lets_siblings_finish() {
        let builder = FnBuilder::new(|name| {
            if name == "y" {
                Err("build of y failed".into())
            } else {
                Ok(Generated::Built)
            }
        });
        let error = executor(builder.clone())
            .run(&names(&["x", "y", "z"]))
            .unwrap_err();

        let LayerError::Failed { failures, .. } = &error else {
            panic!("expected a failed layer, got {error:?}");
        };
        assert_eq!(failures.len(), 1);
        assert_eq!(failures[0].name, "y");
        assert!(error.to_string().contains("y: build of y failed"));

        let mut started = builder.started();
        started.sort();
        assert_eq!(started, ["x", "y", "z"]);
    }

    #[test]
    fn test_failures_after_wait_are_reported() {
        // `slow` fails after `fast` already failed, so it is reported as incomplete with its error.
        let builder = FnBuilder::new(|name| {
            if name == "slow" {
                thread::sleep(Duration::from_millis(200));
            }
            Err(format!("{name} broke").into())
        });
        let error = LayerExecutor::new(builder, Duration::from_secs(30))
            .with_cores(2)
            .run(&names(&["slow", "fast"]))
            .unwrap_err();

        let LayerError::Failed { failures, pending } = &error else {
            panic!("expected a failed layer, got {error:?}");
        };
        assert_eq!(failures[0].name, "fast");
        assert_eq!(pending.len(), 1);
        assert_eq!(pending[0].name, "slow");
        let message = error.to_string();
        assert!(message.contains("the following jobs were incomplete: slow"));
        assert!(message.contains("slow raised the following error: slow broke"));
    }

    #[test]
    fn test_timeout_reports_incomplete() {
        let finished = Arc::new(AtomicUsize::new(0));
        let builder = FnBuilder::new({
            let finished = Arc::clone(&finished);
            move |name| {
                if name == "slow" {
                    thread::sleep(Duration::from_millis(500));
                }
                finished.fetch_add(1, Ordering::SeqCst);
                Ok(Generated::Built)
            }
        });
        let error = LayerExecutor::new(builder, Duration::from_millis(100))
            .with_cores(2)
            .run(&names(&["fast", "slow"]))
            .unwrap_err();

        assert!(matches!(&error, LayerError::Incomplete { .. }));
        assert_eq!(error.images(), ["slow"]);
        assert!(error.to_string().contains("incomplete: slow"));
    }

    #[test]
    fn test_panic_is_a_failure() {
        let builder = FnBuilder::new(|name| {
            if name == "x" {
                panic!("oh no");
            }
            Ok(Generated::Built)
        });
        let error = executor(builder).run(&names(&["x"])).unwrap_err();
        assert!(error.to_string().contains("generating image \"x\" panicked"));
    }

    #[test]
    fn test_deadline() {
        assert!(Deadline::after(Duration::from_secs(60)).remaining().is_some());
        assert!(Deadline::after(Duration::ZERO).remaining().is_none());
        assert_eq!(Deadline::after(Duration::MAX).remaining(), Some(Duration::MAX));
    }

    #[test]
    fn test_unbounded_timeout() {
        let builder = FnBuilder::new(|_| Ok(Generated::Built));
        let reports = LayerExecutor::new(builder, Duration::from_secs(u64::MAX))
            .run(&names(&["x", "y"]))
            .unwrap();
        assert_eq!(reports.len(), 2);
    }

    #[test]
    fn test_spawn_failure_empties_queue() {
        let builder = FnBuilder::new(|_| Ok(Generated::Built));
        let queue = Arc::new(Mutex::new(
            names(&["x", "y"]).into_iter().enumerate().collect::<VecDeque<_>>(),
        ));
        let (sender, receiver) = mpsc::channel();

        let result = start_workers(&queue, 2, |worker| {
            if worker > 0 {
                return Err(io::Error::new(io::ErrorKind::Other, "no more threads"));
            }
            let queue = Arc::clone(&queue);
            let sender = sender.clone();
            let builder: Arc<dyn Builder> = builder.clone();
            thread::Builder::new().spawn(move || work(&queue, &sender, builder.as_ref()))
        });
        drop(sender);

        assert!(result.is_err());
        // The started worker exits without a result once it sees the empty queue.
        assert!(receiver.recv().is_err());
        assert!(builder.started().is_empty());
    }
}
