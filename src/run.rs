use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{anyhow, Result};
use futures::stream::{FuturesUnordered, StreamExt};
use tokio::sync::watch;
use tokio::task::AbortHandle;
use tokio::time::Instant;
use tracing::{debug, error, warn};

use crate::configuration::{Configuration, OperationContext, Outcome, WorkerError};
use crate::sample::{OpKind, OperationSample, SampleSender};

/// How long a worker waits when there is nothing to operate on yet.
pub const NOT_READY_BACKOFF: Duration = Duration::from_secs(1);

/// Observes whether the run was asked to stop.
#[derive(Clone)]
pub struct StopSignal(watch::Receiver<bool>);

impl StopSignal {
    pub(crate) fn new(rx: watch::Receiver<bool>) -> Self {
        Self(rx)
    }

    pub fn is_stopped(&self) -> bool {
        *self.0.borrow()
    }

    /// Completes once the run is asked to stop.
    pub async fn stopped(&mut self) {
        while !*self.0.borrow_and_update() {
            if self.0.changed().await.is_err() {
                // The controller is gone, nobody can ask us to stop anymore
                std::future::pending::<()>().await;
            }
        }
    }
}

/// Sleeps for `duration` unless the run is asked to stop in the meantime.
///
/// Returns `false` if the sleep was interrupted.
pub async fn sleep_unless_stopped(stop: &mut StopSignal, duration: Duration) -> bool {
    tokio::select! {
        _ = tokio::time::sleep(duration) => true,
        _ = stop.stopped() => false,
    }
}

/// Drives a single worker: issues operation contexts, accounts the results
/// and hands a sample to the aggregator every tick.
pub struct WorkerSession {
    kind: OpKind,
    operation_counter: u64,
    stop: StopSignal,
    samples: SampleSender,
    sample: OperationSample,
    tick_interval: Duration,
    next_flush: Instant,
    finished: bool,
}

impl WorkerSession {
    pub fn new(
        kind: OpKind,
        tick_interval: Duration,
        stop: StopSignal,
        samples: SampleSender,
    ) -> Self {
        Self {
            kind,
            operation_counter: 0,
            stop,
            samples,
            sample: OperationSample::new(kind),
            tick_interval,
            next_flush: Instant::now() + tick_interval,
            finished: false,
        }
    }

    pub fn kind(&self) -> OpKind {
        self.kind
    }

    /// Returns the context of the next operation, or `None` if the worker
    /// should stop. Flushes the current sample if its tick has elapsed, and
    /// a final time when stopping.
    pub fn start(&mut self) -> Option<OperationContext> {
        if self.finished {
            return None;
        }
        if self.stop.is_stopped() {
            self.finish();
            return None;
        }

        let now = Instant::now();
        if now >= self.next_flush {
            self.flush();
            self.next_flush += self.tick_interval;
            if self.next_flush <= now {
                // We fell behind by more than a tick, don't try to catch up
                self.next_flush = now + self.tick_interval;
            }
        }

        let operation_id = self.operation_counter;
        self.operation_counter += 1;
        Some(OperationContext {
            operation_id,
            start_time: Instant::now(),
        })
    }

    /// Accounts the result of the operation started with `ctx`.
    ///
    /// Fails only if the worker must not continue, in which case the whole
    /// run is stopped by the controller.
    pub async fn end(
        &mut self,
        ctx: &OperationContext,
        result: Result<Outcome, WorkerError>,
    ) -> Result<()> {
        match result {
            Ok(Outcome::Completed) => {
                self.sample.record_success(ctx.start_time.elapsed());
            }
            Ok(Outcome::NotReady) => {
                sleep_unless_stopped(&mut self.stop, NOT_READY_BACKOFF).await;
            }
            Err(WorkerError::Store(err)) => {
                debug!(
                    kind = self.kind.as_ref(),
                    operation_id = ctx.operation_id,
                    error = %err,
                    "operation failed",
                );
                self.sample.record_error(err.to_string());
            }
            Err(err @ WorkerError::InvariantViolation(_)) => {
                error!(kind = self.kind.as_ref(), error = %err, "stopping the run");
                self.finish();
                return Err(err.into());
            }
        }
        Ok(())
    }

    fn flush(&mut self) {
        self.samples.send(self.sample.take());
    }

    fn finish(&mut self) {
        self.flush();
        self.finished = true;
    }
}

/// Controls a run started with [`run`].
pub struct RunController {
    stop: watch::Sender<bool>,
    workers: Vec<AbortHandle>,
    // Set when workers were aborted for not stopping within the grace period
    overdue: AtomicBool,
}

impl RunController {
    /// Asks every worker to finish its current operation and stop.
    pub fn ask_to_stop(&self) {
        self.stop.send_replace(true);
    }

    /// Cancels the worker tasks without waiting for their operations.
    pub fn abort(&self) {
        for worker in &self.workers {
            worker.abort();
        }
    }

    pub fn stop_signal(&self) -> StopSignal {
        StopSignal(self.stop.subscribe())
    }

    fn abort_overdue(&self) {
        self.overdue.store(true, Ordering::Relaxed);
        self.abort();
    }
}

/// Spawns the workers described by `config`, each with its own session
/// sending samples to `samples`.
///
/// Returns a controller of the run and a future which completes when all
/// workers have stopped. The run stops when it exceeds the maximum duration,
/// when asked to, or as soon as any worker fails. In the last case the
/// future resolves to the first error.
///
/// Workers get one tick interval to stop. Those still busy after that,
/// e.g. in a store call which never returns, are aborted.
pub fn run(
    config: Configuration,
    samples: SampleSender,
) -> (Arc<RunController>, impl Future<Output = Result<()>>) {
    let start_time = Instant::now();
    let (stop_tx, stop_rx) = watch::channel(false);

    let mut worker_handles = FuturesUnordered::new();
    let mut abort_handles = Vec::new();
    for group in &config.groups {
        for idx in 0..group.count {
            let mut worker = group.factory.create(idx);
            let session = WorkerSession::new(
                group.kind,
                config.tick_interval,
                StopSignal(stop_rx.clone()),
                samples.clone(),
            );
            let handle = tokio::task::spawn(async move { worker.run(session).await });
            abort_handles.push(handle.abort_handle());
            worker_handles.push(handle);
        }
    }
    // Workers hold the only senders, so the aggregator finishes with them
    drop(samples);

    let controller = Arc::new(RunController {
        stop: stop_tx,
        workers: abort_handles,
        overdue: AtomicBool::new(false),
    });

    // Ask to stop once the bench period has elapsed, then make sure
    // the workers are gone one tick later
    let stopper_ctrl = Arc::clone(&controller);
    let max_duration = config.max_duration;
    let grace_period = config.tick_interval;
    let stopper = tokio::task::spawn(async move {
        let mut stop = stopper_ctrl.stop_signal();
        tokio::select! {
            _ = tokio::time::sleep_until(start_time + max_duration) => stopper_ctrl.ask_to_stop(),
            _ = stop.stopped() => {}
        }
        tokio::time::sleep(grace_period).await;
        stopper_ctrl.abort_overdue();
    });

    let ctrl = Arc::clone(&controller);
    let finished = async move {
        let mut result: Result<()> = Ok(());

        while let Some(joined) = worker_handles.next().await {
            let worker_result = match joined {
                Ok(r) => r,
                Err(err) if err.is_cancelled() && ctrl.overdue.load(Ordering::Relaxed) => {
                    warn!(
                        grace_period = ?grace_period,
                        "a worker did not stop in time and was aborted",
                    );
                    Ok(())
                }
                Err(err) if err.is_cancelled() => Err(anyhow!("the run was aborted")),
                Err(err) => Err(anyhow!("worker task panicked: {err}")),
            };
            if let Err(err) = worker_result {
                if result.is_ok() {
                    result = Err(err);
                }
                ctrl.ask_to_stop();
            }
        }

        stopper.abort();
        result
    };

    (controller, finished)
}
