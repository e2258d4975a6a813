// Copyright (c) The sortie Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

use super::{HarnessFn, TestAbort, TestResult, suite::SuiteShared, suite::TestOutcome};
use crate::time::{pausable_sleep, stopwatch};
use camino::Utf8PathBuf;
use futures::{FutureExt, future::BoxFuture};
use sortie_metadata::Verdict;
use std::{
    fmt,
    future::Future,
    sync::{Arc, Mutex, MutexGuard},
    time::Duration,
};
use tokio::{
    sync::mpsc::{self, UnboundedReceiver, UnboundedSender},
    task::{JoinError, JoinHandle},
};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

/// When a node's deadline starts counting down.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub enum TimerStart {
    /// As soon as the node starts.
    #[default]
    Immediate,
    /// Once the body calls [`H::start_exec_timer`].
    Deferred,
}

/// The handle a test body uses to interact with its node.
///
/// Cloning the handle is cheap, and all clones refer to the same node.
#[derive(Clone)]
pub struct H {
    inner: Arc<NodeInner>,
}

struct NodeInner {
    name: String,
    level: usize,
    parent: Option<H>,
    suite: Arc<SuiteShared>,
    cancel: CancellationToken,
    timer: UnboundedSender<TimerCommand>,
    state: Mutex<NodeState>,
}

#[derive(Default)]
struct NodeState {
    failed: bool,
    skipped: bool,
    timed_out: bool,
    done: bool,
    warn_on_failure: bool,
    non_exclusive_test_started: bool,
    output: String,
    subtests: Vec<String>,
    pending: Vec<PendingChild>,
}

impl NodeState {
    fn verdict(&self) -> Verdict {
        if self.failed {
            if self.warn_on_failure {
                Verdict::Warn
            } else {
                Verdict::Fail
            }
        } else if self.skipped {
            Verdict::Skip
        } else {
            Verdict::Pass
        }
    }
}

struct PendingChild {
    node: H,
    run: NodeRun,
    f: HarnessFn,
}

/// Everything needed to execute a node, other than its body.
pub(super) struct NodeRun {
    timeout: Option<Duration>,
    timer_start: TimerStart,
    timer_rx: UnboundedReceiver<TimerCommand>,
}

#[derive(Clone, Copy, Debug)]
enum TimerCommand {
    Start,
    Stop,
}

impl H {
    pub(super) fn root(suite: Arc<SuiteShared>) -> (H, NodeRun) {
        let (timer, timer_rx) = mpsc::unbounded_channel();
        let node = H {
            inner: Arc::new(NodeInner {
                name: String::new(),
                level: 0,
                parent: None,
                suite,
                cancel: CancellationToken::new(),
                timer,
                state: Mutex::new(NodeState::default()),
            }),
        };
        let run = NodeRun {
            timeout: None,
            timer_start: TimerStart::Immediate,
            timer_rx,
        };
        (node, run)
    }

    fn new_child(
        &self,
        name: &str,
        timeout: Option<Duration>,
        timer_start: TimerStart,
    ) -> (H, NodeRun) {
        let parent_name = (self.inner.level > 0).then_some(self.inner.name.as_str());
        let name = self.inner.suite.unique_name(parent_name, name);
        let (timer, timer_rx) = mpsc::unbounded_channel();
        let node = H {
            inner: Arc::new(NodeInner {
                name,
                level: self.inner.level + 1,
                parent: Some(self.clone()),
                suite: self.inner.suite.clone(),
                cancel: self.inner.cancel.child_token(),
                timer,
                state: Mutex::new(NodeState::default()),
            }),
        };
        let run = NodeRun {
            timeout,
            timer_start,
            timer_rx,
        };
        (node, run)
    }

    /// The full name of this node, e.g. `basic/sub`.
    pub fn name(&self) -> &str {
        &self.inner.name
    }

    /// The depth of this node. Top-level tests are at level 1.
    pub fn level(&self) -> usize {
        self.inner.level
    }

    /// Marks this node and all of its ancestors as failed, but keeps running.
    pub fn fail(&self) {
        let mut node = Some(self);
        while let Some(h) = node {
            {
                let mut state = h.lock();
                if state.done {
                    debug!(test = %h.name(), "ignoring failure reported after completion");
                    return;
                }
                state.failed = true;
            }
            node = h.inner.parent.as_ref();
        }
    }

    /// Returns true if this node has failed.
    pub fn failed(&self) -> bool {
        self.lock().failed
    }

    /// Returns true if this node was skipped.
    pub fn skipped(&self) -> bool {
        self.lock().skipped
    }

    /// Returns true if this node exceeded its deadline.
    pub fn timed_out(&self) -> bool {
        self.lock().timed_out
    }

    /// Appends a line to this node's output.
    pub fn log(&self, msg: impl fmt::Display) {
        let line = msg.to_string();
        debug!(test = %self.name(), "{line}");
        let mut state = self.lock();
        state.output.push_str(&line);
        if !line.ends_with('\n') {
            state.output.push('\n');
        }
    }

    /// Logs a message and marks the node as failed.
    pub fn error(&self, msg: impl fmt::Display) {
        self.log(msg);
        self.fail();
    }

    /// Logs a message, marks the node as failed, and returns the abort the body should
    /// propagate.
    #[must_use]
    pub fn fatal(&self, msg: impl fmt::Display) -> TestAbort {
        self.error(msg);
        TestAbort::Failed
    }

    /// Marks the node as failed and returns the abort the body should propagate.
    #[must_use]
    pub fn fail_now(&self) -> TestAbort {
        self.fail();
        TestAbort::Failed
    }

    /// Logs a message, marks the node as skipped, and returns the abort the body should
    /// propagate.
    ///
    /// A node that failed before being skipped still counts as failed.
    #[must_use]
    pub fn skip(&self, msg: impl fmt::Display) -> TestAbort {
        self.log(msg);
        self.lock().skipped = true;
        TestAbort::Skipped
    }

    /// The node's execution context. It is cancelled when this node or any ancestor times out.
    pub fn cancellation_token(&self) -> &CancellationToken {
        &self.inner.cancel
    }

    /// Returns a directory for this node's artifacts, creating it if necessary.
    pub fn output_dir(&self) -> std::io::Result<Utf8PathBuf> {
        let dir = self.inner.suite.output_dir().join(self.name());
        std::fs::create_dir_all(&dir)?;
        Ok(dir)
    }

    /// Records the names of this node's subtests for reporting.
    pub fn set_subtests(&self, subtests: Vec<String>) {
        self.lock().subtests = subtests;
    }

    /// The names of this node's subtests.
    pub fn subtests(&self) -> Vec<String> {
        self.lock().subtests.clone()
    }

    /// Downgrades a failure of this node to a warning.
    pub fn warning_on_failure(&self) {
        self.lock().warn_on_failure = true;
    }

    /// Returns true if a failure of this node is downgraded to a warning.
    pub fn is_warning_on_failure(&self) -> bool {
        self.lock().warn_on_failure
    }

    /// Records that a member of this bucket wrapper started running.
    pub fn non_exclusive_test_started(&self) {
        self.lock().non_exclusive_test_started = true;
    }

    /// Returns true if a member of this bucket wrapper started running.
    pub fn was_non_exclusive_test_started(&self) -> bool {
        self.lock().non_exclusive_test_started
    }

    /// Starts or resumes counting down this node's deadline.
    pub fn start_exec_timer(&self) {
        // The receiver is gone once the body has been supervised to completion.
        let _ = self.inner.timer.send(TimerCommand::Start);
    }

    /// Pauses this node's deadline.
    pub fn stop_exec_timer(&self) {
        let _ = self.inner.timer.send(TimerCommand::Stop);
    }

    /// Runs `f` as a sequential subtest and returns true if it passed.
    pub async fn run<F, Fut>(&self, name: &str, f: F) -> bool
    where
        F: FnOnce(H) -> Fut + Send + 'static,
        Fut: Future<Output = TestResult> + Send + 'static,
    {
        self.run_with_timeout(name, None, f).await
    }

    /// Runs `f` as a sequential subtest with a deadline and returns true if it passed.
    pub async fn run_with_timeout<F, Fut>(
        &self,
        name: &str,
        timeout: Option<Duration>,
        f: F,
    ) -> bool
    where
        F: FnOnce(H) -> Fut + Send + 'static,
        Fut: Future<Output = TestResult> + Send + 'static,
    {
        let (child, run) = self.new_child(name, timeout, TimerStart::Immediate);
        run_node(child.clone(), box_body(f), run, false).await;
        !child.failed()
    }

    /// Registers `f` as a parallel subtest. It starts after this node's body returns, once a
    /// parallel slot is free.
    pub fn run_parallel<F, Fut>(&self, name: &str, f: F)
    where
        F: FnOnce(H) -> Fut + Send + 'static,
        Fut: Future<Output = TestResult> + Send + 'static,
    {
        self.run_parallel_with_timeout(name, None, TimerStart::Immediate, f);
    }

    /// Registers `f` as a parallel subtest with a deadline.
    pub fn run_parallel_with_timeout<F, Fut>(
        &self,
        name: &str,
        timeout: Option<Duration>,
        timer_start: TimerStart,
        f: F,
    ) where
        F: FnOnce(H) -> Fut + Send + 'static,
        Fut: Future<Output = TestResult> + Send + 'static,
    {
        self.register_parallel(name, timeout, timer_start, box_body(f));
    }

    pub(super) fn register_parallel(
        &self,
        name: &str,
        timeout: Option<Duration>,
        timer_start: TimerStart,
        f: HarnessFn,
    ) {
        let (node, run) = self.new_child(name, timeout, timer_start);
        self.lock().pending.push(PendingChild { node, run, f });
    }

    /// Runs `fut` on its own task, failing the node if its execution context is cancelled
    /// first.
    ///
    /// On cancellation the task is left to finish in the background, and its result is
    /// discarded.
    pub async fn run_with_exec_timeout_check<Fut>(
        &self,
        fut: Fut,
        msg: &str,
    ) -> Result<Fut::Output, TestAbort>
    where
        Fut: Future + Send + 'static,
        Fut::Output: Send + 'static,
    {
        let mut task = tokio::spawn(fut);
        tokio::select! {
            res = &mut task => res.map_err(|err| self.fatal(format_args!("{msg}: {err}"))),
            () = self.inner.cancel.cancelled() => {
                debug!(test = %self.name(), "abandoning `{msg}` after cancellation");
                Err(self.fatal(format_args!("{msg}: execution timeout")))
            }
        }
    }

    fn time_out(&self, timeout: Duration) {
        self.lock().timed_out = true;
        self.error(format_args!(
            "TIMEOUT[{}]: {}",
            humantime::format_duration(timeout),
            self.name()
        ));
        self.inner.cancel.cancel();
    }

    fn record_end(&self, end: BodyEnd) {
        match end {
            BodyEnd::Returned(Ok(())) | BodyEnd::TimedOut => {}
            BodyEnd::Returned(Err(TestAbort::Failed)) => self.fail(),
            BodyEnd::Returned(Err(TestAbort::Skipped)) => self.lock().skipped = true,
            BodyEnd::Panicked(msg) => self.error(format_args!("test panicked: {msg}")),
        }
    }

    fn take_pending(&self) -> Vec<PendingChild> {
        std::mem::take(&mut self.lock().pending)
    }

    fn finish(&self, duration: Duration) {
        let outcome = {
            let mut state = self.lock();
            state.done = true;
            TestOutcome {
                name: self.inner.name.clone(),
                level: self.inner.level,
                verdict: state.verdict(),
                duration,
                output: state.output.clone(),
                subtests: state.subtests.clone(),
                non_exclusive_test_started: state.non_exclusive_test_started,
                timed_out: state.timed_out,
            }
        };
        if self.inner.level > 0 {
            self.inner.suite.record(outcome);
        }
    }

    fn lock(&self) -> MutexGuard<'_, NodeState> {
        self.inner
            .state
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

impl fmt::Debug for H {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("H")
            .field("name", &self.inner.name)
            .field("level", &self.inner.level)
            .finish_non_exhaustive()
    }
}

fn box_body<F, Fut>(f: F) -> HarnessFn
where
    F: FnOnce(H) -> Fut + Send + 'static,
    Fut: Future<Output = TestResult> + Send + 'static,
{
    Box::new(move |h| f(h).boxed())
}

enum BodyEnd {
    Returned(TestResult),
    Panicked(String),
    TimedOut,
}

/// Executes a node: runs its body under its deadline, then its parallel subtests, then reports
/// it.
///
/// Parallel nodes hold a slot in the suite's gate while they run. A node gives its slot up while
/// waiting for its parallel subtests.
pub(super) fn run_node(
    node: H,
    f: HarnessFn,
    run: NodeRun,
    parallel: bool,
) -> BoxFuture<'static, ()> {
    async move {
        let stopwatch = stopwatch();
        let body = tokio::spawn(f(node.clone()));
        let end = supervise(&node, body, run).await;
        node.record_end(end);
        let duration = stopwatch.snapshot().duration;

        let pending = node.take_pending();
        let suite = node.inner.suite.clone();
        if !pending.is_empty() {
            suite.gate().release();
            let children: Vec<_> = pending
                .into_iter()
                .map(|child| {
                    let suite = suite.clone();
                    tokio::spawn(async move {
                        suite.gate().wait_parallel().await;
                        run_node(child.node, child.f, child.run, true).await;
                    })
                })
                .collect();
            for child in children {
                if let Err(err) = child.await {
                    node.error(format_args!("parallel subtest task failed: {err}"));
                }
            }
            if !parallel {
                suite.gate().wait_parallel().await;
            }
        } else if parallel {
            suite.gate().release();
        }

        node.finish(duration);
    }
    .boxed()
}

async fn supervise(node: &H, mut body: JoinHandle<TestResult>, run: NodeRun) -> BodyEnd {
    let NodeRun {
        timeout,
        timer_start,
        mut timer_rx,
    } = run;
    let Some(timeout) = timeout else {
        return join_end(body.await);
    };

    let deadline = pausable_sleep(timeout);
    tokio::pin!(deadline);
    if timer_start == TimerStart::Deferred {
        deadline.as_mut().pause();
    }

    loop {
        tokio::select! {
            res = &mut body => return join_end(res),
            () = &mut deadline => break,
            Some(command) = timer_rx.recv() => match command {
                TimerCommand::Start => {
                    if deadline.is_paused() {
                        deadline.as_mut().resume();
                    }
                }
                TimerCommand::Stop => {
                    if !deadline.is_paused() {
                        deadline.as_mut().pause();
                    }
                }
            },
        }
    }

    node.time_out(timeout);
    // Cancellation lets a cooperative body wind down and tear down its resources.
    let grace = node.inner.suite.timeout_grace();
    if tokio::time::timeout(grace, &mut body).await.is_err() {
        warn!(
            test = %node.name(),
            "body did not return within {} of timing out, abandoning it",
            humantime::format_duration(grace),
        );
    }
    BodyEnd::TimedOut
}

fn join_end(res: Result<TestResult, JoinError>) -> BodyEnd {
    match res {
        Ok(result) => BodyEnd::Returned(result),
        Err(err) if err.is_panic() => {
            let payload = err.into_panic();
            let msg = if let Some(s) = payload.downcast_ref::<&str>() {
                (*s).to_owned()
            } else if let Some(s) = payload.downcast_ref::<String>() {
                s.clone()
            } else {
                "(non-string panic payload)".to_owned()
            };
            BodyEnd::Panicked(msg)
        }
        Err(err) => BodyEnd::Panicked(err.to_string()),
    }
}
