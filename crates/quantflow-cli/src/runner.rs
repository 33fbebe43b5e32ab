use crate::input::{Samples, Settings};
use anyhow::Context;
use idxml::IdXmlBuilder;
use log::info;
use quantflow_core::assembly::Assembler;
use quantflow_core::columns::AbundanceColumns;
use quantflow_core::consensus::{read_consensus, restore_retention_times};
use quantflow_core::identification::{IdentificationSource, Psm};
use quantflow_core::params::ParameterDocument;
use quantflow_core::quant::{read_peptide_table, read_protein_table};
use quantflow_core::sink::{QuantResults, QuantSink};
use quantflow_core::tool::{Executor, Progress};
use quantflow_core::Error;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Instant;

/// Tool-backed pipeline stages
#[derive(Copy, Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Stage {
    FeatureFinding,
    Conversion,
    Alignment,
    Linking,
    Normalization,
    PeptideIndexing,
    IdMapping,
    ProteinInference,
    Quantification,
}

impl Stage {
    pub fn default_tool(self) -> &'static str {
        match self {
            Stage::FeatureFinding => "FeatureFinderMultiplex",
            Stage::Conversion => "FileConverter",
            Stage::Alignment => "MapAlignerPoseClustering",
            Stage::Linking => "FeatureLinkerUnlabeledQT",
            Stage::Normalization => "ConsensusMapNormalizer",
            Stage::PeptideIndexing => "PeptideIndexer",
            Stage::IdMapping => "IDMapper",
            Stage::ProteinInference => "Epifany",
            Stage::Quantification => "ProteinQuantifier",
        }
    }
}

/// Files produced once per run
#[derive(Copy, Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Artifact {
    Linked,
    Restored,
    Normalized,
    FilteredIds,
    UnfilteredIds,
    IndexedFilteredIds,
    IndexedUnfilteredIds,
    Mapped,
    ProteinGroups,
    PeptideTable,
    ProteinTable,
}

/// All per-run state: sample file lists, produced artifacts and progress
pub struct RunContext {
    scratch: PathBuf,
    samples: usize,
    names: Vec<PathBuf>,
    features: Vec<PathBuf>,
    aligned: Option<Vec<PathBuf>>,
    artifacts: BTreeMap<Artifact, PathBuf>,
    completed: usize,
    total: usize,
}

impl RunContext {
    fn new(settings: &Settings, scratch: &Path) -> Self {
        let samples = settings.samples.len();
        let features = match &settings.samples {
            Samples::Features(paths) => paths.clone(),
            Samples::Spectra(_) => Vec::new(),
        };
        Self {
            scratch: scratch.into(),
            samples,
            names: settings.samples.paths().to_vec(),
            features,
            aligned: None,
            artifacts: BTreeMap::new(),
            completed: 0,
            total: Self::plan(settings),
        }
    }

    /// Number of steps a run with `settings` takes
    fn plan(settings: &Settings) -> usize {
        let n = settings.samples.len();
        let finding = match settings.samples {
            Samples::Spectra(_) => n,
            Samples::Features(_) => 0,
        };
        let combine = match (n, settings.alignment.enabled) {
            (1, _) => 1,
            // align, link, restore retention times
            (_, true) => 3,
            (_, false) => 1,
        };
        // normalize, export x2, index x2, map, infer, quantify, assemble, publish
        finding + combine + 10
    }

    fn step(&mut self, progress: &mut dyn Progress) {
        self.completed += 1;
        debug_assert!(self.completed <= self.total);
        progress.fraction(self.completed as f64 / self.total as f64);
    }

    fn check_lengths(&self, stage: &str, files: &[PathBuf]) -> quantflow_core::Result<()> {
        if files.len() != self.samples {
            return Err(Error::InputContract(format!(
                "{} produced {} files for {} samples",
                stage,
                files.len(),
                self.samples
            )));
        }
        Ok(())
    }

    fn path<S: AsRef<str>>(&self, name: S) -> PathBuf {
        self.scratch.join(name.as_ref())
    }

    fn register(&mut self, artifact: Artifact, path: PathBuf) -> PathBuf {
        log::trace!("{:?}: {}", artifact, path.display());
        self.artifacts.insert(artifact, path.clone());
        path
    }

    fn artifact(&self, artifact: Artifact) -> anyhow::Result<&Path> {
        self.artifacts
            .get(&artifact)
            .map(PathBuf::as_path)
            .with_context(|| format!("{:?} has not been produced yet", artifact))
    }

    /// Feature files that linking should consume
    fn linkable(&self) -> &[PathBuf] {
        self.aligned.as_deref().unwrap_or(&self.features)
    }

    /// Sample index of a spectrum file name, matched on file stem. A stem
    /// shared by several samples matches none of them.
    fn sample_of(&self, filename: &str) -> Option<usize> {
        let stem = Path::new(filename).file_stem()?;
        let mut hits = self
            .names
            .iter()
            .enumerate()
            .filter(|(_, p)| p.file_stem() == Some(stem))
            .map(|(idx, _)| idx);
        match (hits.next(), hits.next()) {
            (Some(idx), None) => Some(idx),
            _ => None,
        }
    }
}

fn stem(path: &Path) -> String {
    path.file_stem()
        .map(|s| s.to_string_lossy().into_owned())
        .unwrap_or_default()
}

fn list<I, P>(paths: I) -> Vec<String>
where
    I: IntoIterator<Item = P>,
    P: AsRef<Path>,
{
    paths
        .into_iter()
        .map(|p| p.as_ref().to_string_lossy().into_owned())
        .collect()
}

fn display(path: &Path) -> std::borrow::Cow<'_, str> {
    path.to_string_lossy()
}

pub struct Runner {
    pub settings: Settings,
    start: Instant,
}

impl Runner {
    pub fn new(settings: Settings) -> Self {
        Self {
            settings,
            start: Instant::now(),
        }
    }

    /// Materialize the default parameters of the stage's tool, patch them,
    /// apply user overrides and run the tool
    fn tool_stage<E, F>(
        &self,
        ctx: &mut RunContext,
        executor: &mut E,
        progress: &mut dyn Progress,
        stage: Stage,
        label: &str,
        patch: F,
    ) -> anyhow::Result<()>
    where
        E: Executor + ?Sized,
        F: FnOnce(&mut ParameterDocument) -> quantflow_core::Result<()>,
    {
        let tool = self.settings.tool(stage);
        let ini = ctx.path(format!("{}.ini", label));
        info!("{:?}: running {}", stage, tool);

        executor
            .write_defaults(tool, &ini)
            .with_context(|| format!("Failed to generate default parameters for `{tool}`"))?;

        let mut doc = ParameterDocument::load(&ini)?;
        doc.set_nested("1", "threads", self.settings.threads)
            .and_then(|_| patch(&mut doc))
            .and_then(|_| match self.settings.tool_parameters.get(tool) {
                Some(overrides) => doc.apply_overrides(overrides),
                None => Ok(()),
            })
            .with_context(|| format!("Failed to configure `{tool}` ({})", ini.display()))?;

        executor
            .execute(tool, &ini, progress)
            .with_context(|| format!("{:?} stage failed", stage))?;
        ctx.step(progress);
        Ok(())
    }

    fn find_features<E: Executor + ?Sized>(
        &self,
        ctx: &mut RunContext,
        executor: &mut E,
        progress: &mut dyn Progress,
        spectra: &[PathBuf],
    ) -> anyhow::Result<()> {
        let dir = ctx.path("features");
        std::fs::create_dir_all(&dir)?;
        let ff = &self.settings.feature_finding;

        let mut features = Vec::with_capacity(spectra.len());
        for (idx, mzml) in spectra.iter().enumerate() {
            let out = dir.join(format!("{}_{}.featureXML", idx, stem(mzml)));
            self.tool_stage(
                ctx,
                executor,
                progress,
                Stage::FeatureFinding,
                &format!("feature_finding_{}", idx),
                |doc| {
                    doc.set_nested("1", "in", display(mzml))?;
                    doc.set_nested("1", "out", display(&out))?;
                    doc.set_scalar("algorithm:labels", &ff.labels)?;
                    doc.set_scalar("algorithm:charge", &ff.charge)?;
                    doc.set_scalar("algorithm:mz_tolerance", ff.mz_tolerance)?;
                    doc.set_scalar("algorithm:mz_unit", "ppm")?;
                    doc.set_scalar("algorithm:rt_typical", ff.rt_typical)
                },
            )?;
            features.push(out);
        }
        ctx.check_lengths("feature finding", &features)?;
        ctx.features = features;
        Ok(())
    }

    /// Produce one consensus map from the per-sample feature maps
    fn combine<E: Executor + ?Sized>(
        &self,
        ctx: &mut RunContext,
        executor: &mut E,
        progress: &mut dyn Progress,
    ) -> anyhow::Result<()> {
        ctx.check_lengths("feature input", &ctx.features)?;
        let linked = ctx.path("linked.consensusXML");

        if ctx.samples == 1 {
            let input = ctx.features[0].clone();
            self.tool_stage(
                ctx,
                executor,
                progress,
                Stage::Conversion,
                "conversion",
                |doc| {
                    doc.set_nested("1", "in", display(&input))?;
                    doc.set_nested("1", "out", display(&linked))?;
                    doc.set_nested("1", "out_type", "consensusXML")
                },
            )?;
            ctx.register(Artifact::Linked, linked.clone());
            ctx.register(Artifact::Restored, linked);
            return Ok(());
        }

        if self.settings.alignment.enabled {
            let dir = ctx.path("aligned");
            std::fs::create_dir_all(&dir)?;
            let inputs = ctx.features.clone();
            let outputs = inputs
                .iter()
                .enumerate()
                .map(|(idx, p)| dir.join(format!("{}_{}.featureXML", idx, stem(p))))
                .collect::<Vec<_>>();
            let alignment = self.settings.alignment;
            self.tool_stage(
                ctx,
                executor,
                progress,
                Stage::Alignment,
                "alignment",
                |doc| {
                    doc.set_list("1:in", list(&inputs), true)?;
                    doc.set_list("1:out", list(&outputs), true)?;
                    doc.set_thresholds(alignment.mz_tolerance_ppm, alignment.rt_tolerance_min)
                },
            )?;
            ctx.check_lengths("alignment", &outputs)?;
            ctx.aligned = Some(outputs);
        } else {
            log::info!("alignment disabled, linking unaligned feature maps");
        }

        let inputs = ctx.linkable().to_vec();
        let linking = self.settings.linking;
        self.tool_stage(
            ctx,
            executor,
            progress,
            Stage::Linking,
            "linking",
            |doc| {
                doc.set_list("1:in", list(&inputs), true)?;
                doc.set_nested("1", "out", display(&linked))?;
                doc.set_thresholds(linking.mz_tolerance_ppm, linking.rt_tolerance_min)
            },
        )?;
        ctx.register(Artifact::Linked, linked.clone());

        if ctx.aligned.is_some() {
            let restored = ctx.path("restored.consensusXML");
            restore_retention_times(&linked, &ctx.features, &restored)
                .context("Failed to restore original retention times")?;
            ctx.register(Artifact::Restored, restored);
            ctx.step(progress);
        } else {
            ctx.register(Artifact::Restored, linked);
        }
        Ok(())
    }

    fn normalize<E: Executor + ?Sized>(
        &self,
        ctx: &mut RunContext,
        executor: &mut E,
        progress: &mut dyn Progress,
    ) -> anyhow::Result<()> {
        let input = ctx.artifact(Artifact::Restored)?.to_path_buf();
        let out = ctx.path("normalized.consensusXML");
        let method = self.settings.normalization.method;
        self.tool_stage(
            ctx,
            executor,
            progress,
            Stage::Normalization,
            "normalization",
            |doc| {
                doc.set_nested("1", "in", display(&input))?;
                doc.set_nested("1", "out", display(&out))?;
                doc.set_scalar("algorithm_type", method.as_str())
            },
        )?;
        ctx.register(Artifact::Normalized, out);
        Ok(())
    }

    /// Write the q-value filtered and the unfiltered identifications
    fn export_identifications(
        &self,
        ctx: &mut RunContext,
        progress: &mut dyn Progress,
        psms: &[Psm],
    ) -> anyhow::Result<()> {
        let fasta = self.settings.fasta.to_string_lossy();
        let mut filtered = IdXmlBuilder::new(fasta.as_ref());
        let mut unfiltered = IdXmlBuilder::new(fasta.as_ref());
        let mut unassigned = 0;

        for psm in psms {
            let Some(sample) = ctx.sample_of(&psm.filename) else {
                unassigned += 1;
                continue;
            };
            unfiltered
                .add(psm, Some(sample))
                .with_context(|| format!("Failed to export identification {}", psm.id))?;
            if psm.q_value <= self.settings.psm_q_value {
                filtered.add(psm, Some(sample))?;
            }
        }
        if unassigned > 0 {
            log::warn!(
                "skipped {} identifications whose file does not match any sample",
                unassigned
            );
        }
        if unfiltered.is_empty() && !psms.is_empty() {
            return Err(Error::InputContract(format!(
                "none of the {} identifications belong to a sample file",
                psms.len()
            ))
            .into());
        }
        info!(
            "exporting {} identifications, {} at q <= {}",
            unfiltered.len(),
            filtered.len(),
            self.settings.psm_q_value
        );

        let path = ctx.register(Artifact::FilteredIds, ctx.path("filtered.idXML"));
        filtered.write(&path)?;
        ctx.step(progress);

        let path = ctx.register(Artifact::UnfilteredIds, ctx.path("unfiltered.idXML"));
        unfiltered.write(&path)?;
        ctx.step(progress);
        Ok(())
    }

    fn index_peptides<E: Executor + ?Sized>(
        &self,
        ctx: &mut RunContext,
        executor: &mut E,
        progress: &mut dyn Progress,
    ) -> anyhow::Result<()> {
        for (input, output, label) in [
            (
                Artifact::FilteredIds,
                Artifact::IndexedFilteredIds,
                "indexed_filtered",
            ),
            (
                Artifact::UnfilteredIds,
                Artifact::IndexedUnfilteredIds,
                "indexed_unfiltered",
            ),
        ] {
            let input = ctx.artifact(input)?.to_path_buf();
            let out = ctx.path(format!("{}.idXML", label));
            let fasta = &self.settings.fasta;
            let decoy_tag = &self.settings.decoy_tag;
            self.tool_stage(
                ctx,
                executor,
                progress,
                Stage::PeptideIndexing,
                label,
                |doc| {
                    doc.set_nested("1", "in", display(&input))?;
                    doc.set_nested("1", "fasta", display(fasta))?;
                    doc.set_nested("1", "out", display(&out))?;
                    doc.set_scalar("decoy_string", decoy_tag)?;
                    doc.set_scalar("decoy_string_position", "prefix")?;
                    doc.set_scalar("missing_decoy_action", "warn")?;
                    doc.set_scalar("unmatched_action", "warn")
                },
            )?;
            ctx.register(output, out);
        }
        Ok(())
    }

    fn map_identifications<E: Executor + ?Sized>(
        &self,
        ctx: &mut RunContext,
        executor: &mut E,
        progress: &mut dyn Progress,
    ) -> anyhow::Result<()> {
        let ids = ctx.artifact(Artifact::IndexedFilteredIds)?.to_path_buf();
        let consensus = ctx.artifact(Artifact::Normalized)?.to_path_buf();
        let out = ctx.path("mapped.consensusXML");
        let tolerances = self.settings.id_mapping;
        self.tool_stage(
            ctx,
            executor,
            progress,
            Stage::IdMapping,
            "id_mapping",
            |doc| {
                doc.set_nested("1", "id", display(&ids))?;
                doc.set_nested("1", "in", display(&consensus))?;
                doc.set_nested("1", "out", display(&out))?;
                doc.set_scalar("rt_tolerance", tolerances.rt_tolerance_min * 60.0)?;
                doc.set_scalar("mz_tolerance", tolerances.mz_tolerance_ppm)?;
                doc.set_scalar("mz_measure", "ppm")?;
                doc.set_scalar("mz_reference", "peptide")?;
                doc.set_scalar("consensus:use_subelements", "true")
            },
        )?;
        ctx.register(Artifact::Mapped, out);
        Ok(())
    }

    fn infer_proteins<E: Executor + ?Sized>(
        &self,
        ctx: &mut RunContext,
        executor: &mut E,
        progress: &mut dyn Progress,
    ) -> anyhow::Result<()> {
        let ids = ctx.artifact(Artifact::IndexedUnfilteredIds)?.to_path_buf();
        let out = ctx.path("protein_groups.idXML");
        self.tool_stage(
            ctx,
            executor,
            progress,
            Stage::ProteinInference,
            "protein_inference",
            |doc| {
                doc.set_list("1:in", [display(&ids)], true)?;
                doc.set_nested("1", "out", display(&out))?;
                doc.set_scalar("greedy_group_resolution", "remove_proteins_wo_evidence")
            },
        )?;
        ctx.register(Artifact::ProteinGroups, out);
        Ok(())
    }

    fn quantify<E: Executor + ?Sized>(
        &self,
        ctx: &mut RunContext,
        executor: &mut E,
        progress: &mut dyn Progress,
    ) -> anyhow::Result<()> {
        let mapped = ctx.artifact(Artifact::Mapped)?.to_path_buf();
        let groups = ctx.artifact(Artifact::ProteinGroups)?.to_path_buf();
        let proteins = ctx.path("proteins.tsv");
        let peptides = ctx.path("peptides.tsv");
        let quant = self.settings.quantification;
        self.tool_stage(
            ctx,
            executor,
            progress,
            Stage::Quantification,
            "quantification",
            |doc| {
                doc.set_nested("1", "in", display(&mapped))?;
                doc.set_nested("1", "protein_groups", display(&groups))?;
                doc.set_nested("1", "out", display(&proteins))?;
                doc.set_nested("1", "peptide_out", display(&peptides))?;
                doc.set_scalar("top:N", quant.top_n)?;
                doc.set_scalar("top:aggregate", quant.aggregate.as_str())?;
                doc.set_scalar("top:include_all", quant.include_all)
            },
        )?;
        ctx.register(Artifact::ProteinTable, proteins);
        ctx.register(Artifact::PeptideTable, peptides);
        Ok(())
    }

    fn assemble(
        &self,
        ctx: &mut RunContext,
        progress: &mut dyn Progress,
        psms: &[Psm],
    ) -> anyhow::Result<QuantResults> {
        let columns = AbundanceColumns::new(&ctx.names);
        let mapped = read_consensus(ctx.artifact(Artifact::Mapped)?)?;
        if let Some(map) = mapped.maps.iter().find(|m| m.index >= ctx.samples) {
            return Err(Error::DataJoin(format!(
                "consensus map lists map {} ({}) but the run has {} samples",
                map.index, map.name, ctx.samples
            ))
            .into());
        }
        let consensus = Assembler::new(&columns, psms)
            .assemble(&mapped)
            .context("Failed to assemble consensus features")?;
        let peptides = read_peptide_table(ctx.artifact(Artifact::PeptideTable)?, &columns)?;
        let proteins = read_protein_table(ctx.artifact(Artifact::ProteinTable)?, &columns)?;
        info!(
            "quantified {} peptides and {} proteins",
            peptides.len(),
            proteins.len()
        );
        ctx.step(progress);

        Ok(QuantResults {
            columns,
            consensus,
            peptides,
            proteins,
        })
    }

    /// Run every stage in `scratch`, then hand the results to `sink`. Nothing
    /// is published unless all stages succeed.
    pub fn run<E, I, S>(
        &mut self,
        executor: &mut E,
        source: &mut I,
        sink: &mut S,
        progress: &mut dyn Progress,
        scratch: &Path,
    ) -> anyhow::Result<()>
    where
        E: Executor + ?Sized,
        I: IdentificationSource + ?Sized,
        S: QuantSink + ?Sized,
    {
        let mut ctx = RunContext::new(&self.settings, scratch);
        info!(
            "quantifying {} samples in {} steps",
            ctx.samples, ctx.total
        );

        let psms = source
            .load()
            .context("Failed to load peptide-spectrum matches")?;

        if let Samples::Spectra(spectra) = &self.settings.samples {
            self.find_features(&mut ctx, executor, progress, spectra)?;
        }
        self.combine(&mut ctx, executor, progress)?;
        self.normalize(&mut ctx, executor, progress)?;
        self.export_identifications(&mut ctx, progress, &psms)?;
        self.index_peptides(&mut ctx, executor, progress)?;
        self.map_identifications(&mut ctx, executor, progress)?;
        self.infer_proteins(&mut ctx, executor, progress)?;
        self.quantify(&mut ctx, executor, progress)?;
        let results = self.assemble(&mut ctx, progress, &psms)?;

        sink.publish(results).context("Failed to publish results")?;
        ctx.step(progress);

        info!("finished in {}s", self.start.elapsed().as_secs());
        Ok(())
    }

    /// Echo the effective settings and output paths to `results.json`
    pub fn write_summary(&mut self, outputs: &[PathBuf]) -> anyhow::Result<PathBuf> {
        let path = self.settings.output_directory.join("results.json");
        self.settings.output_paths.extend(list(outputs));
        self.settings.output_paths.push(display(&path).into_owned());
        let bytes = serde_json::to_vec_pretty(&self.settings)?;
        std::fs::write(&path, bytes)
            .with_context(|| format!("Failed to write `{}`", path.display()))?;
        Ok(path)
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::input::Input;

    fn settings(dir: &Path, extra: serde_json::Value) -> Settings {
        let mut value = serde_json::json!({
            "openms_bin": "/opt/openms/bin",
            "fasta": "human.fasta",
            "psm_path": "psms.tsv",
            "feature_paths": ["a.featureXML", "b.featureXML", "c.featureXML"],
            "output_directory": dir,
        });
        if let (Some(base), Some(extra)) = (value.as_object_mut(), extra.as_object()) {
            for (k, v) in extra {
                base.insert(k.clone(), v.clone());
            }
        }
        serde_json::from_value::<Input>(value)
            .unwrap()
            .build()
            .unwrap()
    }

    #[test]
    fn step_plan() {
        let dir = tempfile::tempdir().unwrap();
        assert_eq!(RunContext::plan(&settings(dir.path(), serde_json::json!({}))), 13);
        assert_eq!(
            RunContext::plan(&settings(
                dir.path(),
                serde_json::json!({ "alignment": { "enabled": false } })
            )),
            11
        );
        assert_eq!(
            RunContext::plan(&settings(
                dir.path(),
                serde_json::json!({ "feature_paths": ["a.featureXML"] })
            )),
            11
        );
        assert_eq!(
            RunContext::plan(&settings(
                dir.path(),
                serde_json::json!({ "feature_paths": null, "mzml_paths": ["a.mzML", "b.mzML"] })
            )),
            15
        );
    }

    #[test]
    fn samples_match_on_stem() {
        let dir = tempfile::tempdir().unwrap();
        let settings = settings(dir.path(), serde_json::json!({}));
        let ctx = RunContext::new(&settings, dir.path());
        assert_eq!(ctx.sample_of("b.mzML"), Some(1));
        assert_eq!(ctx.sample_of("/raw/c.raw"), Some(2));
        assert_eq!(ctx.sample_of("d.mzML"), None);
    }

    #[test]
    fn shared_stems_match_nothing() {
        let dir = tempfile::tempdir().unwrap();
        let mut settings = settings(dir.path(), serde_json::json!({}));
        settings.samples = Samples::Features(vec![
            "/batch1/run.featureXML".into(),
            "/batch2/run.featureXML".into(),
            "/batch2/other.featureXML".into(),
        ]);
        let ctx = RunContext::new(&settings, dir.path());
        assert_eq!(ctx.sample_of("/batch2/run.mzML"), None);
        assert_eq!(ctx.sample_of("other.mzML"), Some(2));
    }
}
