//! Map validated config onto scheduler options and build inputs.

use pairofcleats_app::{CompletionSettings, IndexBuildInput, OverlapSettings, WriteProgressSettings};
use pairofcleats_config::{QueueConfig, SchedulerConfig, ValidatedSchedulerConfig};
use pairofcleats_domain::SourceFile;
use pairofcleats_ports::RelationsRequest;
use pairofcleats_scheduler::{
    BuildSchedulerOptions, QueueOptions, TelemetryOptions, TokenTotals, WriteBackpressureOptions,
};
use std::time::Duration;

/// Build scheduler options from a validated config.
#[must_use]
pub fn scheduler_options_from_config(config: &ValidatedSchedulerConfig) -> BuildSchedulerOptions {
    let tokens = config.tokens();
    let raw: &SchedulerConfig = config;
    BuildSchedulerOptions {
        enabled: raw.enabled,
        tokens: TokenTotals {
            cpu: tokens.cpu,
            io: tokens.io,
            mem: tokens.memory,
        },
        starvation_ms: raw.starvation_ms,
        queues: raw
            .queues
            .iter()
            .map(|(name, queue)| (name.clone(), queue_options(queue)))
            .collect(),
        write_backpressure: WriteBackpressureOptions {
            enabled: raw.write_backpressure.enabled,
            write_queue: raw.write_backpressure.write_queue.clone(),
            producer_queues: raw.write_backpressure.producer_queues.iter().cloned().collect(),
            pending_threshold: raw.write_backpressure.pending_threshold,
            pending_bytes_threshold: raw.write_backpressure.pending_bytes_threshold,
            oldest_wait_ms_threshold: raw.write_backpressure.oldest_wait_ms_threshold,
        },
        telemetry: TelemetryOptions {
            stage: raw.telemetry.stage.clone(),
            queue_depth_snapshots_enabled: raw.telemetry.queue_depth_snapshots_enabled,
            trace_interval_ms: raw.telemetry.trace_interval_ms,
            queue_depth_snapshot_interval_ms: raw.telemetry.queue_depth_snapshot_interval_ms,
        },
    }
}

const fn queue_options(queue: &QueueConfig) -> QueueOptions {
    QueueOptions {
        priority: queue.priority,
        weight: queue.weight,
        max_pending: queue.max_pending,
        max_pending_bytes: queue.max_pending_bytes,
    }
}

/// Build an index build input for `files` from a validated config.
#[must_use]
pub fn index_input_from_config(
    config: &ValidatedSchedulerConfig,
    files: Vec<SourceFile>,
) -> IndexBuildInput {
    IndexBuildInput {
        files,
        mode: config.indexing.mode,
        relations: RelationsRequest {
            cross_file_inference: config.indexing.cross_file_inference,
            import_graph: config.indexing.import_graph,
        },
        incremental: config.indexing.incremental,
        overlap: OverlapSettings {
            enabled: config.pipeline_overlap.enabled,
            infer_postings: config.pipeline_overlap.infer_postings,
        },
        completion: CompletionSettings {
            stall_poll_ms: config.ordered_completion.stall_poll_ms,
            timeout_ms: config.ordered_completion.timeout_ms,
        },
        write_progress: WriteProgressSettings {
            label: config.write_progress.label.clone(),
            log_interval: Duration::from_millis(config.write_progress.log_interval_ms),
        },
        max_buffered_files: None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pairofcleats_config::{SchedulerEnv, load_scheduler_config_from_sources};
    use pairofcleats_domain::queues;
    use pairofcleats_shared::ErrorEnvelope;

    fn load(overrides: &str) -> Result<ValidatedSchedulerConfig, ErrorEnvelope> {
        load_scheduler_config_from_sources(None, Some(overrides), &SchedulerEnv::default())
    }

    #[test]
    fn token_totals_are_floored_into_options() -> Result<(), ErrorEnvelope> {
        let config = load(r#"{"cpuTokens": 3.9, "ioTokens": 2, "memoryTokens": 1}"#)?;
        let options = scheduler_options_from_config(&config);
        assert_eq!(options.tokens, TokenTotals { cpu: 3, io: 2, mem: 1 });
        Ok(())
    }

    #[test]
    fn producer_queues_become_a_set() -> Result<(), ErrorEnvelope> {
        let config = load(
            r#"{"writeBackpressure": {"producerQueues": ["stage1.cpu", "stage1.cpu", "stage1.postings"]}}"#,
        )?;
        let options = scheduler_options_from_config(&config);
        assert_eq!(options.write_backpressure.producer_queues.len(), 2);
        assert!(options.write_backpressure.producer_queues.contains(queues::STAGE1_CPU));
        Ok(())
    }

    #[test]
    fn queue_overrides_are_carried() -> Result<(), ErrorEnvelope> {
        let config = load(r#"{"queues": {"stage2.write": {"priority": 5, "maxPending": 8}}}"#)?;
        let options = scheduler_options_from_config(&config);
        let queue = options.queues.get(queues::STAGE2_WRITE);
        assert_eq!(queue.map(|queue| queue.priority), Some(5));
        assert_eq!(queue.and_then(|queue| queue.max_pending), Some(8));
        Ok(())
    }

    #[test]
    fn build_input_follows_overlap_and_indexing_flags() -> Result<(), ErrorEnvelope> {
        let config = load(
            r#"{"pipelineOverlap": {"inferPostings": false}, "indexing": {"importGraph": false, "incremental": true}}"#,
        )?;
        let input = index_input_from_config(&config, vec![SourceFile::new("a.rs", "fn a() {}")]);
        assert_eq!(input.files.len(), 1);
        assert!(input.overlap.enabled);
        assert!(!input.overlap.infer_postings);
        assert!(!input.relations.import_graph);
        assert!(input.incremental);
        assert_eq!(
            input.write_progress.log_interval,
            Duration::from_millis(config.write_progress.log_interval_ms)
        );
        Ok(())
    }
}
