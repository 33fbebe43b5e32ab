use clap::{Arg, Command, ValueHint};
use quantflow_cli::input::Input;
use quantflow_cli::output::TsvSink;
use quantflow_cli::psm::PsmTable;
use quantflow_cli::runner::Runner;
use quantflow_core::tool::{LogProgress, ToolRunner};
use std::io::Write;
use std::path::Path;

fn main() -> anyhow::Result<()> {
    env_logger::Builder::default()
        .filter_level(log::LevelFilter::Error)
        .parse_env(env_logger::Env::default().filter_or("QUANTFLOW_LOG", "error,quantflow=info"))
        .init();

    let matches = cli().get_matches();

    let settings = Input::from_arguments(matches)?.build()?;
    let output_directory = settings.output_directory.clone();

    let result = run(Runner::new(settings));
    if let Err(err) = &result {
        log::error!("{:#}", err);
        append_debug_log(&output_directory, err);
    }
    result
}

fn cli() -> Command {
    Command::new("quantflow")
        .version(clap::crate_version!())
        .author(clap::crate_authors!())
        .about("Label-free quantification with the OpenMS tool suite")
        .arg(
            Arg::new("parameters")
                .required(true)
                .value_parser(clap::builder::NonEmptyStringValueParser::new())
                .help("Path to configuration parameters (JSON file)")
                .value_hint(ValueHint::FilePath),
        )
        .arg(
            Arg::new("feature_paths")
                .num_args(1..)
                .value_parser(clap::builder::NonEmptyStringValueParser::new())
                .help(
                    "Paths to featureXML files, one per sample. Overrides sample \
                     files listed in the configuration file.",
                )
                .value_hint(ValueHint::FilePath),
        )
        .arg(
            Arg::new("mzml_paths")
                .long("mzml")
                .num_args(1..)
                .conflicts_with("feature_paths")
                .value_parser(clap::builder::NonEmptyStringValueParser::new())
                .help(
                    "Paths to mzML files, one per sample. Features are detected \
                     before linking. Overrides sample files listed in the configuration file.",
                )
                .value_hint(ValueHint::FilePath),
        )
        .arg(
            Arg::new("fasta")
                .short('f')
                .long("fasta")
                .value_parser(clap::builder::NonEmptyStringValueParser::new())
                .help(
                    "Path to FASTA database. Overrides the FASTA file \
                     specified in the configuration file.",
                )
                .value_hint(ValueHint::FilePath),
        )
        .arg(
            Arg::new("psms")
                .short('p')
                .long("psms")
                .value_parser(clap::builder::NonEmptyStringValueParser::new())
                .help(
                    "Path to the tab-separated peptide-spectrum matches. Overrides \
                     the file specified in the configuration file.",
                )
                .value_hint(ValueHint::FilePath),
        )
        .arg(
            Arg::new("openms_bin")
                .long("openms-bin")
                .value_parser(clap::builder::NonEmptyStringValueParser::new())
                .help("Directory containing the OpenMS executables")
                .value_hint(ValueHint::DirPath),
        )
        .arg(
            Arg::new("output_directory")
                .short('o')
                .long("output_directory")
                .value_parser(clap::builder::NonEmptyStringValueParser::new())
                .help(
                    "Path where quantification results will be written. \
                     Overrides the directory specified in the configuration file.",
                )
                .value_hint(ValueHint::DirPath),
        )
        .arg(
            Arg::new("keep_intermediates")
                .long("keep-intermediates")
                .action(clap::ArgAction::SetTrue)
                .help("Keep parameter files, logs and intermediate tool outputs"),
        )
        .help_template(
            "{usage-heading} {usage}\n\n\
             {about-with-newline}\n\
             Written by {author-with-newline}Version {version}\n\n\
             {all-args}{after-help}",
        )
}

fn run(mut runner: Runner) -> anyhow::Result<()> {
    let scratch = tempfile::Builder::new()
        .prefix("quantflow-")
        .tempdir_in(&runner.settings.output_directory)?;

    let mut executor = ToolRunner::new(&runner.settings.openms_bin, scratch.path());
    let mut source = PsmTable::new(&runner.settings.psm_path, runner.settings.decoy_tag.as_str());
    let mut sink = TsvSink::new(&runner.settings.output_directory);

    let result = runner.run(
        &mut executor,
        &mut source,
        &mut sink,
        &mut LogProgress,
        scratch.path(),
    );

    if runner.settings.keep_intermediates || result.is_err() {
        let kept = scratch.into_path();
        log::info!("intermediate files kept in {}", kept.display());
    } else if let Err(err) = scratch.close() {
        log::warn!("failed to remove intermediate files: {}", err);
    }
    result?;

    let summary = runner.write_summary(sink.written())?;
    log::info!("wrote {}", summary.display());
    Ok(())
}

/// Append the full error chain to `quantflow.debug.log` in the output directory
fn append_debug_log(directory: &Path, err: &anyhow::Error) {
    let path = directory.join("quantflow.debug.log");
    let written = std::fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(&path)
        .and_then(|mut file| writeln!(file, "{:?}\n", err));
    if let Err(e) = written {
        log::warn!("failed to write {}: {}", path.display(), e);
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn command_line() {
        let mut cli = cli();
        cli.clone().debug_assert();
        let help = cli.render_long_help().to_string();
        assert!(help.contains("Written by The quantflow developers"), "{}", help);
    }
}
