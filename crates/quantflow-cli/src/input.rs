use crate::runner::Stage;
use anyhow::{ensure, Context};
use clap::ArgMatches;
use quantflow_core::params::parse_bracketed_list;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::PathBuf;

/// Per-sample input files. Either feature maps produced elsewhere, or
/// spectra that go through feature finding first.
#[derive(Serialize, Clone, Debug, PartialEq)]
#[serde(rename_all = "snake_case")]
pub enum Samples {
    Features(Vec<PathBuf>),
    Spectra(Vec<PathBuf>),
}

impl Samples {
    pub fn paths(&self) -> &[PathBuf] {
        match self {
            Samples::Features(paths) | Samples::Spectra(paths) => paths,
        }
    }

    pub fn len(&self) -> usize {
        self.paths().len()
    }

    pub fn is_empty(&self) -> bool {
        self.paths().is_empty()
    }
}

#[derive(Serialize, Debug)]
/// Actual pipeline parameters - may include overrides or default values not set by user
pub struct Settings {
    pub version: String,
    pub openms_bin: PathBuf,
    pub fasta: PathBuf,
    pub samples: Samples,
    pub psm_path: PathBuf,
    pub threads: usize,
    pub keep_intermediates: bool,
    pub psm_q_value: f64,
    pub decoy_tag: String,
    pub feature_finding: FeatureFindingSettings,
    pub alignment: AlignmentSettings,
    pub linking: LinkingSettings,
    pub normalization: NormalizationSettings,
    pub id_mapping: IdMappingSettings,
    pub quantification: QuantificationSettings,
    pub tools: BTreeMap<Stage, String>,
    pub tool_parameters: BTreeMap<String, BTreeMap<String, String>>,
    pub output_paths: Vec<String>,

    #[serde(skip_serializing)]
    pub output_directory: PathBuf,
}

impl Settings {
    /// Executable configured for `stage`
    pub fn tool(&self, stage: Stage) -> &str {
        self.tools
            .get(&stage)
            .map(String::as_str)
            .unwrap_or_else(|| stage.default_tool())
    }
}

#[derive(Deserialize)]
/// Input pipeline parameters deserialized from JSON file
pub struct Input {
    openms_bin: Option<String>,
    fasta: Option<String>,
    feature_paths: Option<Vec<String>>,
    mzml_paths: Option<Vec<String>>,
    psm_path: Option<String>,
    output_directory: Option<String>,
    threads: Option<usize>,
    keep_intermediates: Option<bool>,
    psm_q_value: Option<f64>,
    decoy_tag: Option<String>,
    feature_finding: Option<FeatureFindingOptions>,
    alignment: Option<AlignmentOptions>,
    linking: Option<LinkingOptions>,
    normalization: Option<NormalizationOptions>,
    id_mapping: Option<IdMappingOptions>,
    quantification: Option<QuantificationOptions>,
    tools: Option<BTreeMap<Stage, String>>,
    tool_parameters: Option<BTreeMap<String, BTreeMap<String, String>>>,
}

#[derive(Serialize, Deserialize, Debug, Default)]
pub struct FeatureFindingOptions {
    labels: Option<String>,
    charge: Option<String>,
    mz_tolerance: Option<f64>,
    rt_typical: Option<f64>,
}

#[derive(Serialize, Clone, Debug, PartialEq)]
pub struct FeatureFindingSettings {
    /// Bracketed label list, `[]` for label-free
    pub labels: String,
    /// Charge range, `min:max`
    pub charge: String,
    /// ppm
    pub mz_tolerance: f64,
    /// Seconds
    pub rt_typical: f64,
}

impl Default for FeatureFindingSettings {
    fn default() -> Self {
        Self {
            labels: "[]".into(),
            charge: "2:5".into(),
            mz_tolerance: 6.0,
            rt_typical: 40.0,
        }
    }
}

impl TryFrom<FeatureFindingOptions> for FeatureFindingSettings {
    type Error = anyhow::Error;

    fn try_from(value: FeatureFindingOptions) -> anyhow::Result<Self> {
        let default = Self::default();
        let settings = Self {
            labels: value.labels.unwrap_or(default.labels),
            charge: value.charge.unwrap_or(default.charge),
            mz_tolerance: value.mz_tolerance.unwrap_or(default.mz_tolerance).abs(),
            rt_typical: value.rt_typical.unwrap_or(default.rt_typical).abs(),
        };
        parse_bracketed_list(&settings.labels)
            .with_context(|| format!("invalid `feature_finding.labels`: {}", settings.labels))?;

        let charges = settings
            .charge
            .split_once(':')
            .and_then(|(lo, hi)| Some((lo.trim().parse::<u8>().ok()?, hi.trim().parse::<u8>().ok()?)));
        match charges {
            Some((lo, hi)) => ensure!(
                lo <= hi,
                "`feature_finding.charge` must be `min:max`, got {}",
                settings.charge
            ),
            None => anyhow::bail!(
                "`feature_finding.charge` must be `min:max`, got {}",
                settings.charge
            ),
        }
        if settings.mz_tolerance > 20.0 {
            log::warn!("feature_finding.mz_tolerance is higher than expected");
        }
        Ok(settings)
    }
}

#[derive(Serialize, Deserialize, Debug, Default)]
pub struct AlignmentOptions {
    enabled: Option<bool>,
    mz_tolerance_ppm: Option<f64>,
    rt_tolerance_min: Option<f64>,
}

#[derive(Serialize, Copy, Clone, Debug, PartialEq)]
pub struct AlignmentSettings {
    pub enabled: bool,
    pub mz_tolerance_ppm: f64,
    pub rt_tolerance_min: f64,
}

impl Default for AlignmentSettings {
    fn default() -> Self {
        Self {
            enabled: true,
            mz_tolerance_ppm: 10.0,
            rt_tolerance_min: 1.0,
        }
    }
}

fn check_tolerances(section: &str, mz_tolerance_ppm: f64, rt_tolerance_min: f64) {
    if mz_tolerance_ppm > 50.0 {
        log::warn!("{}.mz_tolerance_ppm is higher than expected", section);
    }
    if rt_tolerance_min > 5.0 {
        log::warn!(
            "{}.rt_tolerance_min is higher than expected - the value is in minutes",
            section
        );
    }
}

impl From<AlignmentOptions> for AlignmentSettings {
    fn from(value: AlignmentOptions) -> Self {
        let default = Self::default();
        let settings = Self {
            enabled: value.enabled.unwrap_or(default.enabled),
            mz_tolerance_ppm: value
                .mz_tolerance_ppm
                .unwrap_or(default.mz_tolerance_ppm)
                .abs(),
            rt_tolerance_min: value
                .rt_tolerance_min
                .unwrap_or(default.rt_tolerance_min)
                .abs(),
        };
        check_tolerances("alignment", settings.mz_tolerance_ppm, settings.rt_tolerance_min);
        settings
    }
}

#[derive(Serialize, Deserialize, Debug, Default)]
pub struct LinkingOptions {
    mz_tolerance_ppm: Option<f64>,
    rt_tolerance_min: Option<f64>,
}

#[derive(Serialize, Copy, Clone, Debug, PartialEq)]
pub struct LinkingSettings {
    pub mz_tolerance_ppm: f64,
    pub rt_tolerance_min: f64,
}

impl Default for LinkingSettings {
    fn default() -> Self {
        Self {
            mz_tolerance_ppm: 10.0,
            rt_tolerance_min: 1.0,
        }
    }
}

impl From<LinkingOptions> for LinkingSettings {
    fn from(value: LinkingOptions) -> Self {
        let default = Self::default();
        let settings = Self {
            mz_tolerance_ppm: value
                .mz_tolerance_ppm
                .unwrap_or(default.mz_tolerance_ppm)
                .abs(),
            rt_tolerance_min: value
                .rt_tolerance_min
                .unwrap_or(default.rt_tolerance_min)
                .abs(),
        };
        check_tolerances("linking", settings.mz_tolerance_ppm, settings.rt_tolerance_min);
        settings
    }
}

#[derive(Serialize, Deserialize, Copy, Clone, Debug, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum NormalizationMethod {
    #[default]
    Median,
    RobustRegression,
    Quantile,
}

impl NormalizationMethod {
    /// Value of the normalizer's `algorithm_type` parameter
    pub fn as_str(self) -> &'static str {
        match self {
            NormalizationMethod::Median => "median",
            NormalizationMethod::RobustRegression => "robust_regression",
            NormalizationMethod::Quantile => "quantile",
        }
    }
}

#[derive(Serialize, Deserialize, Debug, Default)]
pub struct NormalizationOptions {
    method: Option<NormalizationMethod>,
}

#[derive(Serialize, Copy, Clone, Debug, PartialEq, Default)]
pub struct NormalizationSettings {
    pub method: NormalizationMethod,
}

impl From<NormalizationOptions> for NormalizationSettings {
    fn from(value: NormalizationOptions) -> Self {
        Self {
            method: value.method.unwrap_or_default(),
        }
    }
}

#[derive(Serialize, Deserialize, Debug, Default)]
pub struct IdMappingOptions {
    mz_tolerance_ppm: Option<f64>,
    rt_tolerance_min: Option<f64>,
}

#[derive(Serialize, Copy, Clone, Debug, PartialEq)]
pub struct IdMappingSettings {
    pub mz_tolerance_ppm: f64,
    pub rt_tolerance_min: f64,
}

impl Default for IdMappingSettings {
    fn default() -> Self {
        Self {
            mz_tolerance_ppm: 10.0,
            rt_tolerance_min: 0.5,
        }
    }
}

impl From<IdMappingOptions> for IdMappingSettings {
    fn from(value: IdMappingOptions) -> Self {
        let default = Self::default();
        let settings = Self {
            mz_tolerance_ppm: value
                .mz_tolerance_ppm
                .unwrap_or(default.mz_tolerance_ppm)
                .abs(),
            rt_tolerance_min: value
                .rt_tolerance_min
                .unwrap_or(default.rt_tolerance_min)
                .abs(),
        };
        check_tolerances("id_mapping", settings.mz_tolerance_ppm, settings.rt_tolerance_min);
        settings
    }
}

#[derive(Serialize, Deserialize, Copy, Clone, Debug, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum Aggregate {
    #[default]
    Median,
    Mean,
    WeightedMean,
    Sum,
}

impl Aggregate {
    /// Value of the quantifier's `top:aggregate` parameter
    pub fn as_str(self) -> &'static str {
        match self {
            Aggregate::Median => "median",
            Aggregate::Mean => "mean",
            Aggregate::WeightedMean => "weighted_mean",
            Aggregate::Sum => "sum",
        }
    }
}

#[derive(Serialize, Deserialize, Debug, Default)]
pub struct QuantificationOptions {
    top_n: Option<usize>,
    aggregate: Option<Aggregate>,
    include_all: Option<bool>,
}

#[derive(Serialize, Copy, Clone, Debug, PartialEq)]
pub struct QuantificationSettings {
    /// Number of most abundant peptides per protein; 0 uses all of them
    pub top_n: usize,
    pub aggregate: Aggregate,
    /// Also quantify proteins with fewer than `top_n` peptides
    pub include_all: bool,
}

impl Default for QuantificationSettings {
    fn default() -> Self {
        Self {
            top_n: 3,
            aggregate: Aggregate::Median,
            include_all: true,
        }
    }
}

impl From<QuantificationOptions> for QuantificationSettings {
    fn from(value: QuantificationOptions) -> Self {
        let default = Self::default();
        Self {
            top_n: value.top_n.unwrap_or(default.top_n),
            aggregate: value.aggregate.unwrap_or(default.aggregate),
            include_all: value.include_all.unwrap_or(default.include_all),
        }
    }
}

impl Input {
    pub fn from_arguments(matches: ArgMatches) -> anyhow::Result<Self> {
        let path = matches
            .get_one::<String>("parameters")
            .expect("required parameters");
        let mut input = Input::load(path)
            .with_context(|| format!("Failed to read parameters from `{path}`"))?;

        // Handle JSON configuration overrides
        if let Some(output_directory) = matches.get_one::<String>("output_directory") {
            log::trace!("overriding `output_directory` parameter.");
            input.output_directory = Some(output_directory.into());
        }
        if let Some(fasta) = matches.get_one::<String>("fasta") {
            log::trace!("overriding `fasta` parameter.");
            input.fasta = Some(fasta.into());
        }
        if let Some(psm_path) = matches.get_one::<String>("psms") {
            log::trace!("overriding `psm_path` parameter.");
            input.psm_path = Some(psm_path.into());
        }
        if let Some(openms_bin) = matches.get_one::<String>("openms_bin") {
            log::trace!("overriding `openms_bin` parameter.");
            input.openms_bin = Some(openms_bin.into());
        }
        if let Some(feature_paths) = matches.get_many::<String>("feature_paths") {
            log::trace!("overriding `feature_paths` parameter.");
            input.feature_paths = Some(feature_paths.into_iter().map(|p| p.into()).collect());
            input.mzml_paths = None;
        }
        if let Some(mzml_paths) = matches.get_many::<String>("mzml_paths") {
            log::trace!("overriding `mzml_paths` parameter.");
            input.mzml_paths = Some(mzml_paths.into_iter().map(|p| p.into()).collect());
            input.feature_paths = None;
        }
        if matches.get_flag("keep_intermediates") {
            input.keep_intermediates = Some(true);
        }

        Ok(input)
    }

    pub fn load<S: AsRef<str>>(path: S) -> anyhow::Result<Self> {
        quantflow_core::read_json(path.as_ref()).map_err(anyhow::Error::from)
    }

    pub fn build(self) -> anyhow::Result<Settings> {
        ensure!(
            self.output_directory.is_some(),
            "`output_directory` must be set. For more information try '--help'"
        );
        ensure!(
            self.fasta.is_some(),
            "`fasta` must be set. For more information try '--help'"
        );
        ensure!(
            self.psm_path.is_some(),
            "`psm_path` must be set. For more information try '--help'"
        );
        ensure!(
            self.openms_bin.is_some(),
            "`openms_bin` must be set. For more information try '--help'"
        );

        let samples = match (self.feature_paths, self.mzml_paths) {
            (Some(_), Some(_)) => {
                anyhow::bail!("only one of `feature_paths` and `mzml_paths` may be set")
            }
            (Some(paths), None) => Samples::Features(paths.into_iter().map(Into::into).collect()),
            (None, Some(paths)) => Samples::Spectra(paths.into_iter().map(Into::into).collect()),
            (None, None) => anyhow::bail!(
                "`feature_paths` or `mzml_paths` must be set. For more information try '--help'"
            ),
        };
        ensure!(!samples.is_empty(), "at least one sample file is required");

        let mut stems = fnv::FnvHashSet::default();
        for path in samples.paths() {
            let stem = path.file_stem().unwrap_or_default();
            ensure!(
                stems.insert(stem),
                "sample files must have distinct names, `{}` is used more than once",
                stem.to_string_lossy()
            );
        }

        let psm_q_value = self.psm_q_value.unwrap_or(0.01);
        ensure!(
            (0.0..=1.0).contains(&psm_q_value),
            "`psm_q_value` must be between 0 and 1, got {}",
            psm_q_value
        );
        if psm_q_value > 0.05 {
            log::warn!("psm_q_value is higher than expected");
        }

        let threads = match self.threads {
            Some(0) => {
                log::warn!("`threads: 0` is invalid, using 1");
                1
            }
            Some(n) => n,
            None => num_cpus::get(),
        };

        let output_directory = PathBuf::from(self.output_directory.unwrap_or_default());
        std::fs::create_dir_all(&output_directory).with_context(|| {
            format!(
                "Failed to create output directory `{}`",
                output_directory.display()
            )
        })?;

        Ok(Settings {
            version: clap::crate_version!().into(),
            openms_bin: self.openms_bin.unwrap_or_default().into(),
            fasta: self.fasta.unwrap_or_default().into(),
            samples,
            psm_path: self.psm_path.unwrap_or_default().into(),
            threads,
            keep_intermediates: self.keep_intermediates.unwrap_or(false),
            psm_q_value,
            decoy_tag: self.decoy_tag.unwrap_or_else(|| "rev_".into()),
            feature_finding: self
                .feature_finding
                .unwrap_or_default()
                .try_into()?,
            alignment: self.alignment.map(Into::into).unwrap_or_default(),
            linking: self.linking.map(Into::into).unwrap_or_default(),
            normalization: self.normalization.map(Into::into).unwrap_or_default(),
            id_mapping: self.id_mapping.map(Into::into).unwrap_or_default(),
            quantification: self.quantification.map(Into::into).unwrap_or_default(),
            tools: self.tools.unwrap_or_default(),
            tool_parameters: self.tool_parameters.unwrap_or_default(),
            output_paths: Vec::new(),
            output_directory,
        })
    }
}

#[cfg(test)]
mod test {
    use super::*;

    fn input(dir: &std::path::Path, extra: serde_json::Value) -> Input {
        let mut value = serde_json::json!({
            "openms_bin": "/opt/openms/bin",
            "fasta": "human.fasta",
            "psm_path": "psms.tsv",
            "feature_paths": ["a.featureXML", "b.featureXML"],
            "output_directory": dir.join("out"),
        });
        if let (Some(base), Some(extra)) = (value.as_object_mut(), extra.as_object()) {
            for (k, v) in extra {
                base.insert(k.clone(), v.clone());
            }
        }
        serde_json::from_value(value).unwrap()
    }

    #[test]
    fn defaults() {
        let dir = tempfile::tempdir().unwrap();
        let settings = input(dir.path(), serde_json::json!({})).build().unwrap();
        assert!(dir.path().join("out").is_dir());
        assert_eq!(settings.samples.len(), 2);
        assert!(matches!(settings.samples, Samples::Features(_)));
        assert_eq!(settings.psm_q_value, 0.01);
        assert_eq!(settings.decoy_tag, "rev_");
        assert!(settings.threads >= 1);
        assert!(settings.alignment.enabled);
        assert_eq!(settings.quantification, QuantificationSettings::default());
        assert_eq!(settings.tool(Stage::Linking), "FeatureLinkerUnlabeledQT");
        assert_eq!(settings.tool(Stage::IdMapping), "IDMapper");
    }

    #[test]
    fn overrides() {
        let dir = tempfile::tempdir().unwrap();
        let settings = input(
            dir.path(),
            serde_json::json!({
                "threads": 0,
                "alignment": { "enabled": false, "rt_tolerance_min": -2.0 },
                "normalization": { "method": "robust_regression" },
                "quantification": { "top_n": 0, "aggregate": "weighted_mean" },
                "tools": { "linking": "FeatureLinkerUnlabeledKD" },
                "tool_parameters": { "IDMapper": { "ignore_charge": "true" } }
            }),
        )
        .build()
        .unwrap();

        assert_eq!(settings.threads, 1);
        assert!(!settings.alignment.enabled);
        assert_eq!(settings.alignment.rt_tolerance_min, 2.0);
        assert_eq!(settings.normalization.method.as_str(), "robust_regression");
        assert_eq!(settings.quantification.aggregate.as_str(), "weighted_mean");
        assert_eq!(settings.quantification.top_n, 0);
        assert_eq!(settings.tool(Stage::Linking), "FeatureLinkerUnlabeledKD");
        assert_eq!(settings.tool_parameters["IDMapper"]["ignore_charge"], "true");
    }

    #[test]
    fn invalid_inputs() {
        let dir = tempfile::tempdir().unwrap();
        let both = input(
            dir.path(),
            serde_json::json!({ "mzml_paths": ["a.mzML"] }),
        );
        assert!(both.build().is_err());

        let empty = input(dir.path(), serde_json::json!({ "feature_paths": [] }));
        assert!(empty.build().is_err());

        let q = input(dir.path(), serde_json::json!({ "psm_q_value": 1.5 }));
        assert!(q.build().is_err());

        let labels = input(
            dir.path(),
            serde_json::json!({ "feature_finding": { "labels": "[Lys8" } }),
        );
        assert!(labels.build().is_err());

        let charge = input(
            dir.path(),
            serde_json::json!({ "feature_finding": { "charge": "5:2" } }),
        );
        assert!(charge.build().is_err());

        let shared = input(
            dir.path(),
            serde_json::json!({
                "feature_paths": ["/batch1/run.featureXML", "/batch2/run.featureXML"]
            }),
        );
        let err = shared.build().unwrap_err();
        assert!(err.to_string().contains("`run`"), "{}", err);
    }
}
