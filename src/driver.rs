//! Runs the bundle pipeline over a target matrix.
//!
//! Targets are independent: each one gets its own [`TargetContext`] and
//! work directory, runs on the worker pool, and ends `Published` or
//! `Failed`. A failed target never stops its siblings. The two shared
//! resources, the source cache and the manifest, serialize their own
//! writers through lock files.

use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Instant;

use log::{debug, error, info, warn};
use rayon::prelude::*;
use serde::{Deserialize, Serialize};

use crate::archive::{self, verify_archive, Asset};
use crate::assemble::{assemble, Mount};
use crate::config::{BundleConfig, SourceOrigin, SourceSpec, TargetSpec};
use crate::context::{CancelToken, TargetContext};
use crate::error::{BundleError, ErrorKind, IoResultExt, Result};
use crate::extract::{select, ContainerExtractor, ContainerFormat};
use crate::fetch::{RetryPolicy, SourceFetcher, SystemTransport, Transport};
use crate::fsutil::{now_utc_iso, tmp_name, write_atomic};
use crate::manifest::{ManifestStore, Provenance};
use crate::tree::{LinkMode, StagingTree};
use crate::trim::{trim, TrimRules};

pub const RUN_SUMMARY_FILENAME: &str = "run-summary.json";

/// Where a target is in the pipeline.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TargetState {
    Pending,
    Fetching,
    Extracting,
    Trimming,
    Assembling,
    Building,
    Verifying,
    Published,
    Failed,
}

impl TargetState {
    pub fn as_str(&self) -> &'static str {
        match self {
            TargetState::Pending => "pending",
            TargetState::Fetching => "fetching",
            TargetState::Extracting => "extracting",
            TargetState::Trimming => "trimming",
            TargetState::Assembling => "assembling",
            TargetState::Building => "building",
            TargetState::Verifying => "verifying",
            TargetState::Published => "published",
            TargetState::Failed => "failed",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, TargetState::Published | TargetState::Failed)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StageTiming {
    pub stage: TargetState,
    pub millis: u64,
}

/// Terminal record for one target.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TargetOutcome {
    pub target: String,
    pub state: TargetState,
    /// Stage the target was in when it failed.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub failed_stage: Option<TargetState>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_kind: Option<ErrorKind>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_path: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub asset: Option<Asset>,
    pub trimmed_bytes: u64,
    pub stages: Vec<StageTiming>,
    pub elapsed_millis: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunSummary {
    pub started_at: String,
    pub finished_at: String,
    pub targets: Vec<TargetOutcome>,
}

impl RunSummary {
    pub fn published(&self) -> usize {
        self.targets
            .iter()
            .filter(|t| t.state == TargetState::Published)
            .count()
    }

    pub fn failed(&self) -> usize {
        self.targets
            .iter()
            .filter(|t| t.state == TargetState::Failed)
            .count()
    }

    /// One line per target.
    pub fn table(&self) -> String {
        let mut out = String::new();
        for t in &self.targets {
            let line = match t.state {
                TargetState::Failed => format!(
                    "[bundle:{}] {:<10} {:<18} {} (while {})",
                    t.target,
                    t.state.as_str(),
                    t.error_kind.map(|k| k.to_string()).unwrap_or_default(),
                    t.error_path.as_deref().unwrap_or("-"),
                    t.failed_stage.unwrap_or(TargetState::Pending).as_str()
                ),
                _ => format!(
                    "[bundle:{}] {:<10} {} ({:.1}s)",
                    t.target,
                    t.state.as_str(),
                    t.asset
                        .as_ref()
                        .map(|a| a.relative_path.as_str())
                        .unwrap_or("-"),
                    t.elapsed_millis as f64 / 1000.0
                ),
            };
            out.push_str(&line);
            out.push('\n');
        }
        out.push_str(&format!(
            "{} published, {} failed\n",
            self.published(),
            self.failed()
        ));
        out
    }

    pub fn write(&self, path: &Path) -> Result<()> {
        let mut bytes = serde_json::to_vec_pretty(self).map_err(|e| BundleError::Manifest {
            path: path.to_path_buf(),
            reason: e.to_string(),
        })?;
        bytes.push(b'\n');
        write_atomic(path, &bytes)
    }
}

/// Stage bookkeeping for one target.
struct Progress {
    state: TargetState,
    entered: Instant,
    stages: Vec<StageTiming>,
}

impl Progress {
    fn new() -> Self {
        Self {
            state: TargetState::Pending,
            entered: Instant::now(),
            stages: Vec::new(),
        }
    }

    /// Close the current stage and start `next`, if the target may go on.
    fn enter(&mut self, ctx: &TargetContext, next: TargetState) -> Result<()> {
        ctx.checkpoint(next.as_str())?;
        self.close();
        info!("[bundle:{}] {}", ctx.target, next.as_str());
        self.state = next;
        self.entered = Instant::now();
        Ok(())
    }

    fn close(&mut self) {
        if self.state != TargetState::Pending {
            self.stages.push(StageTiming {
                stage: self.state,
                millis: self.entered.elapsed().as_millis() as u64,
            });
        }
    }
}

/// Output of a successful pipeline run.
struct Built {
    asset: Asset,
    trimmed_bytes: u64,
}

pub struct IntegrationDriver {
    cfg: BundleConfig,
    transport: Arc<dyn Transport>,
    cancel: CancelToken,
}

impl IntegrationDriver {
    pub fn new(cfg: BundleConfig) -> Self {
        Self {
            cfg,
            transport: Arc::new(SystemTransport::new()),
            cancel: CancelToken::new(),
        }
    }

    pub fn with_transport(mut self, transport: Arc<dyn Transport>) -> Self {
        self.transport = transport;
        self
    }

    pub fn with_cancel(mut self, cancel: CancelToken) -> Self {
        self.cancel = cancel;
        self
    }

    pub fn config(&self) -> &BundleConfig {
        &self.cfg
    }

    pub fn summary_path(&self) -> PathBuf {
        self.manifest_store()
            .base_dir()
            .join(RUN_SUMMARY_FILENAME)
    }

    fn manifest_store(&self) -> ManifestStore {
        ManifestStore::new(&self.cfg.manifest).require_reproducible(self.cfg.require_reproducible)
    }

    /// Build every configured target and write the run summary.
    ///
    /// Per-target failures are reported in the summary, not returned.
    /// The error cases are the ones no target could survive: an unusable
    /// cache directory or worker pool.
    pub fn run(&self) -> Result<RunSummary> {
        let started_at = now_utc_iso();
        let fetcher = SourceFetcher::open(&self.cfg.cache_dir, Arc::clone(&self.transport))?
            .with_retry(RetryPolicy {
                attempts: self.cfg.fetch_retries,
                ..RetryPolicy::default()
            });
        let store = self.manifest_store();
        fs::create_dir_all(&self.cfg.output_dir).at(&self.cfg.output_dir)?;

        let pool = rayon::ThreadPoolBuilder::new()
            .num_threads(self.cfg.jobs.max(1))
            .thread_name(|i| format!("bundle-{i}"))
            .build()
            .map_err(|e| BundleError::Config(format!("cannot start worker pool: {e}")))?;

        info!(
            "building {} target(s) with {} worker(s)",
            self.cfg.targets.len(),
            self.cfg.jobs
        );
        let mut targets: Vec<TargetOutcome> = pool.install(|| {
            self.cfg
                .targets
                .par_iter()
                .map(|spec| self.run_target(spec, &fetcher, &store))
                .collect()
        });
        targets.sort_by(|a, b| a.target.cmp(&b.target));

        let summary = RunSummary {
            started_at,
            finished_at: now_utc_iso(),
            targets,
        };
        summary.write(&self.summary_path())?;
        Ok(summary)
    }

    fn run_target(
        &self,
        spec: &TargetSpec,
        fetcher: &SourceFetcher,
        store: &ManifestStore,
    ) -> TargetOutcome {
        let started = Instant::now();
        let mut progress = Progress::new();

        let result = TargetContext::create(
            spec.target.clone(),
            &self.cfg.work_dir,
            self.cfg.target_timeout,
            self.cancel.clone(),
        )
        .and_then(|ctx| {
            let result = self.pipeline(&ctx, spec, fetcher, store, &mut progress);
            ctx.cleanup();
            result
        });

        let failed_stage = progress.state;
        progress.close();
        let mut outcome = TargetOutcome {
            target: spec.target.key(),
            state: TargetState::Published,
            failed_stage: None,
            error_kind: None,
            error_path: None,
            message: None,
            asset: None,
            trimmed_bytes: 0,
            stages: progress.stages,
            elapsed_millis: started.elapsed().as_millis() as u64,
        };
        match result {
            Ok(built) => {
                info!(
                    "[bundle:{}] published {}",
                    spec.target, built.asset.relative_path
                );
                outcome.asset = Some(built.asset);
                outcome.trimmed_bytes = built.trimmed_bytes;
            }
            Err(e) => {
                error!(
                    "[bundle:{}] failed while {}: {e}",
                    spec.target,
                    failed_stage.as_str()
                );
                outcome.state = TargetState::Failed;
                outcome.failed_stage = Some(failed_stage);
                outcome.error_kind = Some(e.kind());
                outcome.error_path = e.path();
                outcome.message = Some(e.to_string());
            }
        }
        outcome
    }

    fn pipeline(
        &self,
        ctx: &TargetContext,
        spec: &TargetSpec,
        fetcher: &SourceFetcher,
        store: &ManifestStore,
        progress: &mut Progress,
    ) -> Result<Built> {
        progress.enter(ctx, TargetState::Fetching)?;
        let deadline = ctx.remaining().map(|left| Instant::now() + left);
        let mut fetched = Vec::with_capacity(spec.sources.len());
        for source in &spec.sources {
            fetched.push(fetch_source(fetcher, source, deadline)?);
            ctx.checkpoint(TargetState::Fetching.as_str())?;
        }

        progress.enter(ctx, TargetState::Extracting)?;
        let mut extractor = ContainerExtractor::new(&ctx.scratch("blobs")?)?.with_context(ctx);
        let mut trees = Vec::with_capacity(spec.sources.len());
        for (source, archives) in spec.sources.iter().zip(&fetched) {
            trees.push(extract_source(&mut extractor, source, archives)?);
            ctx.checkpoint(TargetState::Extracting.as_str())?;
        }

        progress.enter(ctx, TargetState::Trimming)?;
        let mut trimmed_bytes = 0;
        let mut mounts = Vec::with_capacity(trees.len());
        for (source, tree) in spec.sources.iter().zip(trees) {
            let rules = TrimRules {
                include: source.include.clone(),
                exclude: if source.trim {
                    spec.exclude.clone()
                } else {
                    Vec::new()
                },
            };
            let tree = if rules == TrimRules::default() {
                tree
            } else {
                debug!("[bundle:{}] trimming source '{}'", ctx.target, source.name);
                let (tree, removed) = trim(tree, &rules)?;
                trimmed_bytes += removed;
                tree
            };
            mounts.push(Mount {
                name: source.name.clone(),
                root: source.mount.clone(),
                tree,
            });
        }

        progress.enter(ctx, TargetState::Assembling)?;
        let tree = assemble(&ctx.target, mounts, &spec.links)?;
        if let Some(stage_root) = &self.cfg.stage_dir {
            self.stage(ctx, &tree, stage_root)?;
        }

        progress.enter(ctx, TargetState::Building)?;
        let file_name = ctx.target.asset_file_name(&self.cfg.name);
        let unpublished = tmp_name(&file_name);
        let built = archive::build_within(
            &tree,
            self.cfg.compression,
            ctx,
            &self.cfg.output_dir,
            &unpublished,
        )?;
        let built_path = self.cfg.output_dir.join(&unpublished);

        let published = self.publish(ctx, spec, store, progress, built, &built_path, &file_name);
        if published.is_err() {
            let _ = fs::remove_file(&built_path);
        }
        Ok(Built {
            asset: published?,
            trimmed_bytes,
        })
    }

    /// Verify the freshly built archive, move it to its final name and
    /// record it in the manifest.
    #[allow(clippy::too_many_arguments)]
    fn publish(
        &self,
        ctx: &TargetContext,
        spec: &TargetSpec,
        store: &ManifestStore,
        progress: &mut Progress,
        mut asset: Asset,
        built_path: &Path,
        file_name: &str,
    ) -> Result<Asset> {
        progress.enter(ctx, TargetState::Verifying)?;
        let entries = verify_archive(built_path, &asset)?;
        debug!(
            "[bundle:{}] archive lists {} entries, every link resolves",
            ctx.target,
            entries.len()
        );

        // Last chance to stop before anything becomes visible.
        ctx.checkpoint(TargetState::Verifying.as_str())?;
        let final_path = self.cfg.output_dir.join(file_name);
        asset.relative_path = self.cfg.asset_href(file_name);

        let provenance = spec
            .sources
            .iter()
            .map(|s| Provenance {
                source: s.name.clone(),
                urls: s.origin.urls(),
                sha256: s.origin.upstream_sha256(),
            })
            .collect();
        store.publish(&asset, built_path, &final_path, provenance)?;
        if !store.verify(&ctx.target)? {
            return Err(BundleError::Verify {
                path: final_path,
                expected: asset.sha256.clone(),
                actual: "asset on disk does not match the manifest record".to_string(),
            });
        }
        Ok(asset)
    }

    /// Write the assembled tree out under `stage_root/<target>` for inspection.
    fn stage(&self, ctx: &TargetContext, tree: &StagingTree, stage_root: &Path) -> Result<()> {
        let dest = stage_root.join(ctx.target.key());
        if dest.exists() {
            fs::remove_dir_all(&dest).at(&dest)?;
        }
        fs::create_dir_all(stage_root).at(stage_root)?;
        let report = tree.materialize(&dest, LinkMode::Auto)?;
        if !report.recorded_links.is_empty() {
            warn!(
                "[bundle:{}] {} link(s) staged as records only in {}",
                ctx.target,
                report.recorded_links.len(),
                dest.display()
            );
        }
        info!(
            "[bundle:{}] staged {} files, {} links at {}",
            ctx.target,
            report.files,
            report.real_links,
            dest.display()
        );
        Ok(())
    }
}

/// Local paths and formats of a source's containers, fetched if remote.
fn fetch_source(
    fetcher: &SourceFetcher,
    source: &SourceSpec,
    deadline: Option<Instant>,
) -> Result<Vec<(PathBuf, ContainerFormat)>> {
    let with_format = |path: PathBuf, format: Option<ContainerFormat>| -> Result<_> {
        let format = match format {
            Some(f) => f,
            None => ContainerFormat::detect(&path)?,
        };
        Ok((path, format))
    };

    match &source.origin {
        SourceOrigin::Archives(archives) => archives
            .iter()
            .map(|a| {
                let entry = fetcher.fetch_within(&a.url, a.sha256.as_deref(), deadline)?;
                with_format(entry.local_path, a.format)
            })
            .collect(),
        SourceOrigin::Parts {
            parts,
            sha256,
            format,
        } => {
            let entry = fetcher.fetch_parts(parts, sha256, deadline)?;
            Ok(vec![with_format(entry.local_path, *format)?])
        }
        SourceOrigin::Local { path, format } => Ok(vec![with_format(path.clone(), *format)?]),
    }
}

fn extract_source(
    extractor: &mut ContainerExtractor,
    source: &SourceSpec,
    archives: &[(PathBuf, ContainerFormat)],
) -> Result<StagingTree> {
    let tree = match archives {
        [(archive, format)] => extractor.extract(archive, *format)?,
        _ => extractor.extract_all(archives)?,
    };
    match (&source.select, archives.first()) {
        (Some(sel), Some((archive, _))) => select(&tree, sel, archive),
        _ => Ok(tree),
    }
}
