use std::any::Any;
use std::io::IsTerminal;
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::{Duration, Instant};

use crate::config::HostConfig;
use crate::core::{Code, RULE_ERROR, Report};
use crate::rules::{Rule, RuleSet, TagFilter};

#[derive(Debug, Clone, Default)]
pub struct EngineOptions {
    /// 0 spawns one worker per selected rule.
    pub max_workers: usize,
    pub show_progress: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RunSummary {
    pub selected: usize,
    pub errored: Vec<String>,
    pub elapsed: Duration,
}

#[derive(Debug, Clone, Default)]
pub struct Scheduler {
    opts: EngineOptions,
}

impl Scheduler {
    pub fn new(opts: EngineOptions) -> Self {
        Self { opts }
    }

    pub fn run(
        &self,
        rules: &RuleSet,
        config: &HostConfig,
        report: &Report,
        filter: &TagFilter,
    ) -> RunSummary {
        let started = Instant::now();
        let selected = rules.select(filter);
        let total = selected.len();
        let workers = match self.opts.max_workers {
            0 => total,
            n => n.min(total),
        };
        tracing::debug!(selected = total, workers, "dispatching rules");

        let pb = if self.opts.show_progress && std::io::stderr().is_terminal() && total > 0 {
            let pb = indicatif::ProgressBar::new(total as u64);
            pb.set_draw_target(indicatif::ProgressDrawTarget::stderr());
            pb.set_style(
                indicatif::ProgressStyle::with_template("{spinner} {pos}/{len} {msg}")
                    .unwrap_or_else(|_| indicatif::ProgressStyle::default_spinner()),
            );
            pb.set_message("running checks...");
            pb.enable_steady_tick(Duration::from_millis(120));
            Some(pb)
        } else {
            None
        };

        let cursor = AtomicUsize::new(0);
        let errored: Vec<String> = std::thread::scope(|scope| {
            let handles: Vec<_> = (0..workers)
                .map(|_| {
                    scope.spawn(|| {
                        let mut failed = Vec::new();
                        loop {
                            let idx = cursor.fetch_add(1, Ordering::Relaxed);
                            let Some(rule) = selected.get(idx) else {
                                break;
                            };
                            if !run_unit(rule, config, report) {
                                failed.push(rule.name().to_string());
                            }
                            if let Some(pb) = &pb {
                                pb.inc(1);
                            }
                        }
                        failed
                    })
                })
                .collect();
            handles
                .into_iter()
                .flat_map(|h| h.join().unwrap_or_default())
                .collect()
        });

        if let Some(pb) = pb {
            pb.finish_and_clear();
        }

        let summary = RunSummary {
            selected: total,
            errored,
            elapsed: started.elapsed(),
        };
        tracing::debug!(
            selected = summary.selected,
            errored = summary.errored.len(),
            elapsed_ms = summary.elapsed.as_millis() as u64,
            "rules finished"
        );
        summary
    }
}

fn run_unit(rule: &Rule, config: &HostConfig, report: &Report) -> bool {
    tracing::debug!(rule = rule.name(), "rule started");
    let outcome = catch_unwind(AssertUnwindSafe(|| rule.invoke(config, report)));
    let message = match outcome {
        Ok(Ok(())) => {
            tracing::debug!(rule = rule.name(), "rule finished");
            return true;
        }
        Ok(Err(err)) => format!("{:#}", err),
        Err(payload) => format!("panicked: {}", panic_message(payload.as_ref())),
    };
    tracing::warn!(rule = rule.name(), error = %message, "rule aborted");
    report.record_failure(
        rule.name(),
        &format!("{} raised an error: {message}", rule.name()),
        Code::new(RULE_ERROR),
        rule.tags(),
        None,
    );
    false
}

pub(crate) fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        return (*s).to_string();
    }
    if let Some(s) = payload.downcast_ref::<String>() {
        return s.clone();
    }
    "unknown panic".to_string()
}
