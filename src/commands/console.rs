// src/commands/console.rs

//! Console policy layer
//!
//! Renders cache and execute progress with indicatif bars and answers
//! files-in-use reports from a fixed retry budget. Everything else is
//! logged through `LoggingCallbacks`.

use corral::apply::ExecutionResult;
use corral::callbacks::{Control, FilesInUseDecision, LoggingCallbacks, PackageDecision};
use corral::plan::PlanEntry;
use corral::{Action, EngineCallbacks, RestartState, STATUS_SUCCESS};
use indicatif::{MultiProgress, ProgressBar, ProgressDrawTarget, ProgressStyle};

pub struct ConsoleCallbacks {
    multi: MultiProgress,
    cache: ProgressBar,
    execute: ProgressBar,
    files_in_use_retries: u32,
    log: LoggingCallbacks,
}

fn bar_style() -> ProgressStyle {
    ProgressStyle::default_bar()
        .template("{prefix:>8} [{bar:40.green/dim}] {pos:>3}% {msg}")
        .unwrap_or_else(|_| ProgressStyle::default_bar())
        .progress_chars("##-")
}

impl ConsoleCallbacks {
    pub fn new(files_in_use_retries: u32, show_progress: bool) -> Self {
        let multi = if show_progress {
            MultiProgress::new()
        } else {
            MultiProgress::with_draw_target(ProgressDrawTarget::hidden())
        };

        let cache = multi.add(ProgressBar::new(100));
        cache.set_style(bar_style());
        cache.set_prefix("cache");

        let execute = multi.add(ProgressBar::new(100));
        execute.set_style(bar_style());
        execute.set_prefix("execute");

        Self {
            multi,
            cache,
            execute,
            files_in_use_retries,
            log: LoggingCallbacks,
        }
    }

    fn line(&self, message: String) {
        let _ = self.multi.println(message);
    }
}

impl EngineCallbacks for ConsoleCallbacks {
    fn on_plan_package_complete(&self, entry: &PlanEntry) {
        self.log.on_plan_package_complete(entry);
    }

    fn on_apply_begin(&self, action_count: usize) -> Control {
        self.log.on_apply_begin(action_count)
    }

    fn on_elevate_complete(&self, status: i32) {
        self.log.on_elevate_complete(status);
    }

    fn on_cache_begin(&self, package_count: usize) -> Control {
        self.cache
            .set_message(format!("{} packages", package_count));
        Control::Continue
    }

    fn on_cache_acquire_progress(
        &self,
        _package_id: &str,
        payload_id: &str,
        _bytes: u64,
        _total: u64,
        overall_percent: u8,
    ) -> Control {
        self.cache.set_position(u64::from(overall_percent));
        self.cache.set_message(payload_id.to_string());
        Control::Continue
    }

    fn on_cache_package_complete(
        &self,
        package_id: &str,
        status: i32,
        attempt: u32,
    ) -> corral::callbacks::CacheDecision {
        self.log.on_cache_package_complete(package_id, status, attempt)
    }

    fn on_cache_complete(&self, status: i32) {
        if status == STATUS_SUCCESS {
            self.cache.set_position(100);
            self.cache.finish_with_message("done");
        } else {
            self.cache.abandon_with_message(format!("failed (0x{:08x})", status));
        }
    }

    fn on_execute_package_begin(&self, package_id: &str, action: Action) -> PackageDecision {
        self.execute.set_message(format!("{} {}", action, package_id));
        PackageDecision::default()
    }

    fn on_execute_progress(&self, _package_id: &str, _package_percent: u8, overall_percent: u8) -> Control {
        self.execute.set_position(u64::from(overall_percent));
        Control::Continue
    }

    fn on_execute_files_in_use(&self, package_id: &str, files: &[String], retries: u32) -> FilesInUseDecision {
        self.line(format!(
            "Files in use by {}: {}",
            package_id,
            files.join(", ")
        ));
        if retries < self.files_in_use_retries {
            FilesInUseDecision::Retry
        } else {
            FilesInUseDecision::Abort
        }
    }

    fn on_execute_package_complete(&self, package_id: &str, result: &ExecutionResult, restart: RestartState) {
        self.log.on_execute_package_complete(package_id, result, restart);
        self.line(format!("  {} {}", package_id, result.status));
    }

    fn on_rollback_package_complete(&self, package_id: &str, status: i32) {
        self.log.on_rollback_package_complete(package_id, status);
        if status == STATUS_SUCCESS {
            self.line(format!("  rolled back {}", package_id));
        } else {
            self.line(format!("  rollback of {} failed (0x{:08x})", package_id, status));
        }
    }

    fn on_execute_complete(&self, status: i32) {
        if status == STATUS_SUCCESS {
            self.execute.set_position(100);
            self.execute.finish_with_message("done");
        } else {
            self.execute.abandon_with_message(format!("failed (0x{:08x})", status));
        }
    }

    fn on_apply_complete(&self, status: i32, restart: RestartState) {
        self.log.on_apply_complete(status, restart);
    }
}
