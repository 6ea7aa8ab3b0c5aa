//! Step logs: append-only named output channels with incremental observers.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use serde::{Deserialize, Serialize};

use crate::error::{Result, StepError};
use crate::progress::ProgressTracker;
use crate::store::StepStore;

/// Kind of content a log holds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogType {
    /// Interleaved stdout, stderr and header lines from a command.
    Stdio,
    /// Plain text.
    Text,
    /// Pre-rendered markup.
    Html,
}

impl LogType {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Stdio => "stdio",
            Self::Text => "text",
            Self::Html => "html",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Channel {
    Stdout,
    Stderr,
    Header,
}

fn canonical_encoding(encoding: &str) -> Option<&'static str> {
    match encoding.trim().to_ascii_lowercase().replace('_', "-").as_str() {
        "utf-8" | "utf8" => Some("utf-8"),
        "latin-1" | "latin1" | "iso-8859-1" | "iso8859-1" => Some("latin-1"),
        _ => None,
    }
}

pub fn is_supported_encoding(encoding: &str) -> bool {
    canonical_encoding(encoding).is_some()
}

/// Decode raw worker output. UTF-8 is decoded lossily.
pub fn decode_bytes(bytes: &[u8], encoding: &str) -> Result<String> {
    match canonical_encoding(encoding) {
        Some("utf-8") => Ok(String::from_utf8_lossy(bytes).into_owned()),
        Some(_) => Ok(bytes.iter().map(|&b| b as char).collect()),
        None => Err(StepError::config(format!("unsupported log encoding '{encoding}'"))),
    }
}

/// Receives log content as it is appended.
pub trait LogObserver: Send {
    fn on_chunk(&mut self, channel: Channel, text: &str) -> anyhow::Result<()>;

    fn on_finish(&mut self) -> anyhow::Result<()> {
        Ok(())
    }
}

type LineCallback = Box<dyn FnMut(Channel, &str) -> anyhow::Result<()> + Send>;

/// Calls back once per complete line; a trailing partial line is held until
/// more content arrives or the log finishes.
pub struct LineObserver {
    callback: LineCallback,
    partial: HashMap<Channel, String>,
}

impl LineObserver {
    pub fn new(callback: impl FnMut(Channel, &str) -> anyhow::Result<()> + Send + 'static) -> Self {
        Self {
            callback: Box::new(callback),
            partial: HashMap::new(),
        }
    }
}

impl LogObserver for LineObserver {
    fn on_chunk(&mut self, channel: Channel, text: &str) -> anyhow::Result<()> {
        let buffer = self.partial.entry(channel).or_default();
        buffer.push_str(text);
        while let Some(pos) = buffer.find('\n') {
            let line: String = buffer.drain(..=pos).collect();
            (self.callback)(channel, line.trim_end_matches(['\n', '\r']))?;
        }
        Ok(())
    }

    fn on_finish(&mut self) -> anyhow::Result<()> {
        let mut channels: Vec<Channel> = self.partial.keys().copied().collect();
        channels.sort();
        for channel in channels {
            if let Some(rest) = self.partial.remove(&channel) {
                if !rest.is_empty() {
                    (self.callback)(channel, &rest)?;
                }
            }
        }
        Ok(())
    }
}

#[derive(Debug, Default)]
struct Buffers {
    stdout: String,
    stderr: String,
}

/// Accumulates stdout and/or stderr. Clones share the same buffers, so keep
/// one handle and attach another to the log.
#[derive(Debug, Clone)]
pub struct BufferObserver {
    want_stdout: bool,
    want_stderr: bool,
    buffers: Arc<Mutex<Buffers>>,
}

impl BufferObserver {
    pub fn new(want_stdout: bool, want_stderr: bool) -> Self {
        Self {
            want_stdout,
            want_stderr,
            buffers: Arc::default(),
        }
    }

    fn buffers(&self) -> MutexGuard<'_, Buffers> {
        self.buffers.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn stdout(&self) -> String {
        self.buffers().stdout.clone()
    }

    pub fn stderr(&self) -> String {
        self.buffers().stderr.clone()
    }
}

impl LogObserver for BufferObserver {
    fn on_chunk(&mut self, channel: Channel, text: &str) -> anyhow::Result<()> {
        match channel {
            Channel::Stdout if self.want_stdout => self.buffers().stdout.push_str(text),
            Channel::Stderr if self.want_stderr => self.buffers().stderr.push_str(text),
            _ => {}
        }
        Ok(())
    }
}

/// Reports the cumulative stdout byte count into a progress metric.
pub struct OutputProgressObserver {
    progress: Arc<ProgressTracker>,
    metric: String,
    bytes: u64,
}

impl OutputProgressObserver {
    pub fn new(progress: Arc<ProgressTracker>, metric: impl Into<String>) -> Self {
        Self {
            progress,
            metric: metric.into(),
            bytes: 0,
        }
    }
}

impl LogObserver for OutputProgressObserver {
    fn on_chunk(&mut self, channel: Channel, text: &str) -> anyhow::Result<()> {
        if channel == Channel::Stdout {
            self.bytes += text.len() as u64;
            self.progress.set(&self.metric, self.bytes)?;
        }
        Ok(())
    }
}

struct LogInner {
    finished: bool,
    observers: Vec<Box<dyn LogObserver>>,
}

/// One named output channel of a running step.
pub struct Log {
    name: String,
    log_type: LogType,
    encoding: String,
    log_id: i64,
    store: Arc<dyn StepStore>,
    inner: tokio::sync::Mutex<LogInner>,
}

impl std::fmt::Debug for Log {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Log")
            .field("name", &self.name)
            .field("log_type", &self.log_type)
            .field("log_id", &self.log_id)
            .finish()
    }
}

impl Log {
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn log_type(&self) -> LogType {
        self.log_type
    }

    pub fn encoding(&self) -> &str {
        &self.encoding
    }

    pub fn log_id(&self) -> i64 {
        self.log_id
    }

    pub async fn is_finished(&self) -> bool {
        self.inner.lock().await.finished
    }

    pub async fn add_observer(&self, observer: Box<dyn LogObserver>) {
        self.inner.lock().await.observers.push(observer);
    }

    pub fn decode(&self, bytes: &[u8]) -> Result<String> {
        decode_bytes(bytes, &self.encoding)
    }

    /// Main content. For text and html logs this is the whole log.
    pub async fn add_stdout(&self, text: &str) -> Result<()> {
        self.append(Channel::Stdout, text).await
    }

    pub async fn add_stderr(&self, text: &str) -> Result<()> {
        self.append(Channel::Stderr, text).await
    }

    pub async fn add_header(&self, text: &str) -> Result<()> {
        self.append(Channel::Header, text).await
    }

    pub async fn add_content(&self, text: &str) -> Result<()> {
        self.append(Channel::Stdout, text).await
    }

    pub async fn add_raw(&self, channel: Channel, bytes: &[u8]) -> Result<()> {
        let text = self.decode(bytes)?;
        self.append(channel, &text).await
    }

    async fn append(&self, channel: Channel, text: &str) -> Result<()> {
        if channel != Channel::Stdout && self.log_type != LogType::Stdio {
            let kind = match channel {
                Channel::Stderr => "stderr",
                _ => "header",
            };
            return Err(StepError::LogType(self.name.clone(), kind));
        }
        let mut inner = self.inner.lock().await;
        if inner.finished {
            return Err(StepError::LogFinished(self.name.clone()));
        }
        if text.is_empty() {
            return Ok(());
        }
        self.store.append_log(self.log_id, channel, text).await?;
        for observer in inner.observers.iter_mut() {
            observer.on_chunk(channel, text)?;
        }
        Ok(())
    }

    /// Close the log. Finishing an already finished log is a no-op.
    pub async fn finish(&self) -> Result<()> {
        let mut inner = self.inner.lock().await;
        if inner.finished {
            return Ok(());
        }
        inner.finished = true;
        self.store.finish_log(self.log_id).await?;
        let mut first_error = None;
        for observer in inner.observers.iter_mut() {
            if let Err(e) = observer.on_finish() {
                first_error.get_or_insert(e);
            }
        }
        match first_error {
            Some(e) => Err(e.into()),
            None => Ok(()),
        }
    }
}

/// The logs of one step.
pub struct LogStore {
    step_id: i64,
    default_encoding: String,
    store: Arc<dyn StepStore>,
    accepting: std::sync::atomic::AtomicBool,
    logs: tokio::sync::Mutex<Vec<Arc<Log>>>,
    pending_observers: Mutex<HashMap<String, Vec<Box<dyn LogObserver>>>>,
}

impl LogStore {
    pub fn new(store: Arc<dyn StepStore>, step_id: i64, default_encoding: impl Into<String>) -> Self {
        Self {
            step_id,
            default_encoding: default_encoding.into(),
            store,
            accepting: std::sync::atomic::AtomicBool::new(false),
            logs: tokio::sync::Mutex::new(Vec::new()),
            pending_observers: Mutex::new(HashMap::new()),
        }
    }

    pub(crate) fn open(&self) {
        self.accepting.store(true, std::sync::atomic::Ordering::SeqCst);
    }

    fn is_accepting(&self) -> bool {
        self.accepting.load(std::sync::atomic::Ordering::SeqCst)
    }

    fn pending(&self) -> MutexGuard<'_, HashMap<String, Vec<Box<dyn LogObserver>>>> {
        self.pending_observers
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    pub async fn create(&self, name: &str, log_type: LogType) -> Result<Arc<Log>> {
        self.create_with_encoding(name, log_type, None).await
    }

    pub async fn create_with_encoding(
        &self,
        name: &str,
        log_type: LogType,
        encoding: Option<&str>,
    ) -> Result<Arc<Log>> {
        if !self.is_accepting() {
            return Err(StepError::InvalidState {
                expected: "running step",
                found: format!("log '{name}' created outside execution"),
            });
        }
        let encoding = encoding.unwrap_or(&self.default_encoding);
        if !is_supported_encoding(encoding) {
            return Err(StepError::config(format!("unsupported log encoding '{encoding}'")));
        }

        let mut logs = self.logs.lock().await;
        if logs.iter().any(|l| l.name == name) {
            return Err(StepError::DuplicateLog(name.to_string()));
        }
        let log_id = self.store.add_log(self.step_id, name, log_type).await?;
        let observers = self.pending().remove(name).unwrap_or_default();
        let log = Arc::new(Log {
            name: name.to_string(),
            log_type,
            encoding: encoding.to_string(),
            log_id,
            store: self.store.clone(),
            inner: tokio::sync::Mutex::new(LogInner {
                finished: false,
                observers,
            }),
        });
        logs.push(log.clone());
        tracing::debug!(step_id = self.step_id, log = %name, "log created");
        Ok(log)
    }

    pub async fn get(&self, name: &str) -> Result<Arc<Log>> {
        self.logs
            .lock()
            .await
            .iter()
            .find(|l| l.name == name)
            .cloned()
            .ok_or_else(|| StepError::LogNotFound(name.to_string()))
    }

    pub async fn get_or_create(&self, name: &str, log_type: LogType) -> Result<Arc<Log>> {
        match self.get(name).await {
            Ok(log) => Ok(log),
            Err(StepError::LogNotFound(_)) => match self.create(name, log_type).await {
                Err(StepError::DuplicateLog(_)) => self.get(name).await,
                other => other,
            },
            Err(e) => Err(e),
        }
    }

    pub async fn names(&self) -> Vec<String> {
        self.logs.lock().await.iter().map(|l| l.name.clone()).collect()
    }

    /// Create a log, write `content` and finish it.
    pub async fn append_complete(&self, name: &str, log_type: LogType, content: &str) -> Result<Arc<Log>> {
        let log = self.create(name, log_type).await?;
        log.add_content(content).await?;
        log.finish().await?;
        Ok(log)
    }

    /// Attach an observer to `name`, now or as soon as the log is created.
    pub async fn add_observer(&self, name: &str, observer: Box<dyn LogObserver>) {
        let logs = self.logs.lock().await;
        match logs.iter().find(|l| l.name == name) {
            Some(log) => log.add_observer(observer).await,
            None => {
                self.pending().entry(name.to_string()).or_default().push(observer);
            }
        }
    }

    /// Stop accepting new logs and finish every open one. Returns the first
    /// error after attempting all of them.
    pub async fn finish_all(&self) -> Result<()> {
        self.accepting.store(false, std::sync::atomic::Ordering::SeqCst);
        let logs: Vec<Arc<Log>> = self.logs.lock().await.clone();
        let mut first_error = None;
        for log in logs {
            if let Err(e) = log.finish().await {
                tracing::warn!(step_id = self.step_id, log = %log.name, error = %e, "failed to finish log");
                first_error.get_or_insert(e);
            }
        }
        match first_error {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }
}
