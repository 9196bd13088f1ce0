//! An in-process kernel for tests.
//!
//! [`FakeKernelLauncher`] speaks the same raw message protocol as the process
//! kernel but interprets a tiny line-oriented language instead of Python:
//!
//! ```text
//! print("text")      stdout stream "text\n"; print(name) prints a variable
//! eprint("text")     stderr stream
//! name = value       assignment of a number or quoted string
//! name               execute_result with the value, or NameError
//! 42 / "text"        execute_result with the literal
//! raise Name("msg")  error
//! sleep(secs)        silent wait; interrupting it raises KeyboardInterrupt
//! exit()             the kernel dies without reporting idle
//! ```

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use serde_json::json;
use tokio::sync::{Notify, mpsc};
use tokio_util::sync::CancellationToken;

use crate::kernel::{
    EVENT_CHANNEL_CAPACITY, KernelControl, KernelError, KernelLauncher, KernelMessage,
    LaunchedKernel,
};

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct FakeKernelStats {
    pub launches: usize,
    pub interrupts: usize,
    /// Highest number of executions submitted but not yet idle.
    pub max_outstanding: usize,
}

#[derive(Default)]
struct Counters {
    always_fail: AtomicBool,
    fail_next: AtomicUsize,
    launches: AtomicUsize,
    interrupts: AtomicUsize,
    outstanding: AtomicUsize,
    max_outstanding: AtomicUsize,
}

#[derive(Clone, Default)]
pub struct FakeKernelLauncher {
    counters: Arc<Counters>,
}

impl FakeKernelLauncher {
    pub fn new() -> Self {
        Self::default()
    }

    /// Every launch fails.
    pub fn failing(self) -> Self {
        self.counters.always_fail.store(true, Ordering::SeqCst);
        self
    }

    /// The next `count` launches fail.
    pub fn fail_next_launches(&self, count: usize) {
        self.counters.fail_next.store(count, Ordering::SeqCst);
    }

    pub fn stats(&self) -> FakeKernelStats {
        FakeKernelStats {
            launches: self.counters.launches.load(Ordering::SeqCst),
            interrupts: self.counters.interrupts.load(Ordering::SeqCst),
            max_outstanding: self.counters.max_outstanding.load(Ordering::SeqCst),
        }
    }

    fn should_fail(&self) -> bool {
        if self.counters.always_fail.load(Ordering::SeqCst) {
            return true;
        }
        self.counters
            .fail_next
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
    }
}

#[async_trait]
impl KernelLauncher for FakeKernelLauncher {
    async fn launch(&self) -> Result<LaunchedKernel, KernelError> {
        if self.should_fail() {
            return Err(KernelError::ExitedDuringStartup {
                stderr_tail: "fake kernel refused to start".to_string(),
            });
        }
        self.counters.launches.fetch_add(1, Ordering::SeqCst);

        let (command_tx, command_rx) = mpsc::unbounded_channel();
        let (event_tx, events) = mpsc::channel(EVENT_CHANNEL_CAPACITY);
        let interrupt = Arc::new(Notify::new());
        let shutdown = CancellationToken::new();

        let kernel = FakeKernel {
            events: event_tx,
            interrupt: Arc::clone(&interrupt),
            shutdown: shutdown.clone(),
            counters: Arc::clone(&self.counters),
            namespace: HashMap::new(),
            execution_count: 0,
        };
        tokio::spawn(kernel.run(command_rx));

        Ok(LaunchedKernel {
            control: Box::new(FakeKernelControl {
                commands: command_tx,
                interrupt,
                shutdown,
                counters: Arc::clone(&self.counters),
            }),
            events,
        })
    }
}

struct ExecuteCommand {
    request_id: String,
    code: String,
}

struct FakeKernelControl {
    commands: mpsc::UnboundedSender<ExecuteCommand>,
    interrupt: Arc<Notify>,
    shutdown: CancellationToken,
    counters: Arc<Counters>,
}

#[async_trait]
impl KernelControl for FakeKernelControl {
    async fn execute(&self, request_id: &str, code: &str) -> Result<(), KernelError> {
        let outstanding = self.counters.outstanding.fetch_add(1, Ordering::SeqCst) + 1;
        self.counters
            .max_outstanding
            .fetch_max(outstanding, Ordering::SeqCst);
        let sent = self.commands.send(ExecuteCommand {
            request_id: request_id.to_string(),
            code: code.to_string(),
        });
        if sent.is_err() {
            self.counters.outstanding.fetch_sub(1, Ordering::SeqCst);
            return Err(KernelError::NotRunning);
        }
        Ok(())
    }

    async fn interrupt(&self) -> Result<(), KernelError> {
        self.counters.interrupts.fetch_add(1, Ordering::SeqCst);
        self.interrupt.notify_waiters();
        Ok(())
    }

    async fn shutdown(&self) -> Result<(), KernelError> {
        self.shutdown.cancel();
        Ok(())
    }
}

impl Drop for FakeKernelControl {
    fn drop(&mut self) {
        self.shutdown.cancel();
    }
}

#[derive(Debug, Clone)]
enum Value {
    Number(String),
    Text(String),
}

impl Value {
    fn repr(&self) -> String {
        match self {
            Value::Number(n) => n.clone(),
            Value::Text(t) => format!("'{t}'"),
        }
    }

    fn display(&self) -> String {
        match self {
            Value::Number(n) => n.clone(),
            Value::Text(t) => t.clone(),
        }
    }
}

struct Fault {
    ename: String,
    evalue: String,
}

impl Fault {
    fn new(ename: &str, evalue: impl Into<String>) -> Self {
        Self {
            ename: ename.to_string(),
            evalue: evalue.into(),
        }
    }
}

enum LineOutcome {
    Continue,
    Fault(Fault),
    Shutdown,
}

struct FakeKernel {
    events: mpsc::Sender<KernelMessage>,
    interrupt: Arc<Notify>,
    shutdown: CancellationToken,
    counters: Arc<Counters>,
    namespace: HashMap<String, Value>,
    execution_count: u64,
}

impl FakeKernel {
    async fn run(mut self, mut commands: mpsc::UnboundedReceiver<ExecuteCommand>) {
        loop {
            let command = tokio::select! {
                () = self.shutdown.cancelled() => break,
                command = commands.recv() => match command {
                    Some(command) => command,
                    None => break,
                },
            };
            if !self.execute(command).await {
                break;
            }
        }
    }

    async fn emit(&self, msg: KernelMessage) {
        let _ = self.events.send(msg).await;
    }

    /// Returns false when the kernel was shut down mid-execution.
    async fn execute(&mut self, command: ExecuteCommand) -> bool {
        let parent = Some(command.request_id.as_str());
        self.execution_count += 1;
        self.emit(KernelMessage::status(parent, "busy")).await;
        self.emit(KernelMessage::new(
            "execute_input",
            parent,
            json!({"code": command.code, "execution_count": self.execution_count}),
        ))
        .await;

        for (index, line) in command.code.lines().enumerate() {
            match self.run_line(&command.request_id, line.trim()).await {
                LineOutcome::Continue => {}
                LineOutcome::Shutdown => return false,
                LineOutcome::Fault(fault) => {
                    let traceback = vec![
                        "Traceback (most recent call last):".to_string(),
                        format!("  File \"<cell>\", line {}, in <module>", index + 1),
                        format!("{}: {}", fault.ename, fault.evalue),
                    ];
                    self.emit(KernelMessage::new(
                        "error",
                        parent,
                        json!({"ename": fault.ename, "evalue": fault.evalue, "traceback": traceback}),
                    ))
                    .await;
                    break;
                }
            }
        }

        self.counters.outstanding.fetch_sub(1, Ordering::SeqCst);
        self.emit(KernelMessage::status(parent, "idle")).await;
        true
    }

    async fn run_line(&mut self, request_id: &str, line: &str) -> LineOutcome {
        if line.is_empty() || line.starts_with('#') {
            return LineOutcome::Continue;
        }

        if let Some(arg) = call_arg(line, "print") {
            return self.print(request_id, "stdout", arg).await;
        }
        if let Some(arg) = call_arg(line, "eprint") {
            return self.print(request_id, "stderr", arg).await;
        }
        if let Some(arg) = call_arg(line, "sleep") {
            return self.sleep(arg).await;
        }
        if call_arg(line, "exit").is_some() {
            return LineOutcome::Shutdown;
        }
        if let Some(rest) = line.strip_prefix("raise ") {
            return LineOutcome::Fault(parse_raise(rest.trim()));
        }
        if let Some((name, value)) = line.split_once('=') {
            let name = name.trim();
            if !is_identifier(name) {
                return LineOutcome::Fault(Fault::new("SyntaxError", "invalid syntax"));
            }
            return match self.eval(value.trim()) {
                Ok(value) => {
                    self.namespace.insert(name.to_string(), value);
                    LineOutcome::Continue
                }
                Err(fault) => LineOutcome::Fault(fault),
            };
        }

        match self.eval(line) {
            Ok(value) => {
                self.emit(KernelMessage::new(
                    "execute_result",
                    Some(request_id),
                    json!({
                        "execution_count": self.execution_count,
                        "data": {"text/plain": value.repr()},
                    }),
                ))
                .await;
                LineOutcome::Continue
            }
            Err(fault) => LineOutcome::Fault(fault),
        }
    }

    async fn print(&self, request_id: &str, stream: &str, arg: &str) -> LineOutcome {
        let value = match self.eval(arg) {
            Ok(value) => value,
            Err(fault) => return LineOutcome::Fault(fault),
        };
        self.emit(KernelMessage::new(
            "stream",
            Some(request_id),
            json!({"name": stream, "text": format!("{}\n", value.display())}),
        ))
        .await;
        LineOutcome::Continue
    }

    async fn sleep(&self, arg: &str) -> LineOutcome {
        let Ok(secs) = arg.trim().parse::<f64>() else {
            return LineOutcome::Fault(Fault::new("TypeError", "sleep() needs a number"));
        };
        let duration = Duration::try_from_secs_f64(secs).unwrap_or(Duration::ZERO);
        tokio::select! {
            () = tokio::time::sleep(duration) => LineOutcome::Continue,
            () = self.interrupt.notified() => LineOutcome::Fault(Fault::new("KeyboardInterrupt", "")),
            () = self.shutdown.cancelled() => LineOutcome::Shutdown,
        }
    }

    fn eval(&self, expr: &str) -> Result<Value, Fault> {
        if let Some(text) = quoted(expr) {
            return Ok(Value::Text(text.to_string()));
        }
        if expr.parse::<f64>().is_ok() {
            return Ok(Value::Number(expr.to_string()));
        }
        if is_identifier(expr) {
            return self
                .namespace
                .get(expr)
                .cloned()
                .ok_or_else(|| Fault::new("NameError", format!("name '{expr}' is not defined")));
        }
        Err(Fault::new("SyntaxError", "invalid syntax"))
    }
}

fn call_arg<'a>(line: &'a str, function: &str) -> Option<&'a str> {
    line.strip_prefix(function)?
        .strip_prefix('(')?
        .strip_suffix(')')
        .map(str::trim)
}

fn quoted(expr: &str) -> Option<&str> {
    expr.strip_prefix('"')
        .and_then(|rest| rest.strip_suffix('"'))
        .or_else(|| expr.strip_prefix('\'').and_then(|rest| rest.strip_suffix('\'')))
}

fn is_identifier(s: &str) -> bool {
    let mut chars = s.chars();
    matches!(chars.next(), Some(c) if c.is_ascii_alphabetic() || c == '_')
        && chars.all(|c| c.is_ascii_alphanumeric() || c == '_')
}

fn parse_raise(rest: &str) -> Fault {
    match rest.split_once('(') {
        Some((name, arg)) => {
            let arg = arg.strip_suffix(')').unwrap_or(arg).trim();
            let message = quoted(arg).unwrap_or(arg);
            Fault::new(name.trim(), message)
        }
        None => Fault::new(rest, ""),
    }
}
