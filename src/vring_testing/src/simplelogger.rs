/*
Copyright 2026  The Hyperlight Authors.

Licensed under the Apache License, Version 2.0 (the "License");
you may not use this file except in compliance with the License.
You may obtain a copy of the License at

    http://www.apache.org/licenses/LICENSE-2.0

Unless required by applicable law or agreed to in writing, software
distributed under the License is distributed on an "AS IS" BASIS,
WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
See the License for the specific language governing permissions and
limitations under the License.
*/

// this is a non threadsafe logger for testing purposes, to test the log messages emitted by the
// ring engine. Records are tagged with the thread that emitted them so that tests running in
// parallel only see their own.

use std::sync::{Mutex, MutexGuard, Once, PoisonError};
use std::thread::{ThreadId, current};

use log::{Level, Log, Metadata, Record, set_logger, set_max_level};

static LOGGER: SimpleLogger = SimpleLogger {};
static INITLOGGER: Once = Once::new();

#[derive(Clone, Debug, Eq, PartialEq)]
pub struct LogCall {
    pub level: Level,
    pub args: String,
    pub target: String,
    pub line: Option<u32>,
    pub file: Option<String>,
    pub module_path: Option<String>,
    pub thread: ThreadId,
}

static LOGCALLS: Mutex<Vec<LogCall>> = Mutex::new(Vec::new());

fn log_calls() -> MutexGuard<'static, Vec<LogCall>> {
    LOGCALLS.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Only records from the ring engine itself are captured.
fn is_engine_target(target: &str) -> bool {
    target == "vring" || target.starts_with("vring::")
}

pub struct SimpleLogger {}

impl SimpleLogger {
    /// Install the logger once per process and return it.
    pub fn initialize_test_logger() -> &'static SimpleLogger {
        INITLOGGER.call_once(|| {
            // another logger already installed means nothing gets captured,
            // which the assertions in the calling test will point out
            let _ = set_logger(&LOGGER);
            set_max_level(log::LevelFilter::Trace);
        });
        &LOGGER
    }

    /// Records emitted by the calling thread.
    pub fn log_calls(&self) -> Vec<LogCall> {
        let me = current().id();
        log_calls()
            .iter()
            .filter(|c| c.thread == me)
            .cloned()
            .collect()
    }

    pub fn num_log_calls(&self) -> usize {
        self.log_calls().len()
    }

    pub fn get_log_call(&self, idx: usize) -> Option<LogCall> {
        self.log_calls().get(idx).cloned()
    }

    /// Calling thread's records at `level`.
    pub fn calls_at(&self, level: Level) -> Vec<LogCall> {
        self.log_calls()
            .into_iter()
            .filter(|c| c.level == level)
            .collect()
    }

    pub fn clear_log_calls(&self) {
        let me = current().id();
        log_calls().retain(|c| c.thread != me);
    }

    pub fn test_log_records<F: Fn(&Vec<LogCall>)>(&self, f: F) {
        let calls = self.log_calls();
        f(&calls);
        self.clear_log_calls();
    }
}

impl Log for SimpleLogger {
    fn enabled(&self, metadata: &Metadata) -> bool {
        is_engine_target(metadata.target()) && metadata.level() <= log::max_level()
    }

    fn log(&self, record: &Record) {
        if !self.enabled(record.metadata()) {
            return;
        }

        log_calls().push(LogCall {
            level: record.level(),
            args: format!("{}", record.args()),
            target: record.target().to_string(),
            line: record.line(),
            file: record.file().map(|file| file.to_string()),
            module_path: record
                .module_path()
                .map(|module_path| module_path.to_string()),
            thread: current().id(),
        });

        println!("Thread {:?} {:?}", current().id(), record);
    }

    fn flush(&self) {}
}
