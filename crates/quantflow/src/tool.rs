//! Launching external tools and following their progress output

use crate::{Error, Result};
use std::fs::File;
use std::io::{BufRead, BufReader, BufWriter, Read, Write};
use std::path::{Path, PathBuf};
use std::process::{Child, Command, ExitStatus, Stdio};
use std::thread::JoinHandle;

/// Receives transient status updates from running tools and overall
/// pipeline progress
pub trait Progress {
    /// `percent` of `phase` reported by the tool currently running
    fn status(&mut self, tool: &str, phase: &str, percent: f32);

    /// Fraction of pipeline steps completed, in `[0, 1]`
    fn fraction(&mut self, fraction: f64);
}

/// Report progress through the `log` facade
#[derive(Default)]
pub struct LogProgress;

impl Progress for LogProgress {
    fn status(&mut self, tool: &str, phase: &str, percent: f32) {
        log::trace!("{}: {} {:.1}%", tool, phase, percent);
    }

    fn fraction(&mut self, fraction: f64) {
        log::info!("progress: {:.0}%", fraction * 100.0);
    }
}

/// Everything the pipeline needs from the tool suite. [`ToolRunner`] is the
/// process-backed implementation.
pub trait Executor {
    /// Ask `tool` to write its default parameter document to `ini`
    fn write_defaults(&mut self, tool: &str, ini: &Path) -> Result<()>;

    /// Run `tool` configured by the parameter document at `ini`
    fn execute(&mut self, tool: &str, ini: &Path, progress: &mut dyn Progress) -> Result<()>;
}

/// Extracts `(phase, percent)` pairs from tool stdout.
///
/// Tools announce a phase with `Progress of '<phase>':` and then print
/// percentages (`  42.17 %`) for it.
#[derive(Default, Debug)]
pub struct ProgressScanner {
    phase: Option<String>,
}

impl ProgressScanner {
    pub fn scan(&mut self, line: &str) -> Option<(&str, f32)> {
        const MARKER: &str = "Progress of '";
        if let Some(start) = line.find(MARKER) {
            let rest = &line[start + MARKER.len()..];
            let phase = rest.split('\'').next().unwrap_or(rest);
            self.phase = Some(phase.to_string());
            return None;
        }

        let phase = self.phase.as_deref()?;
        let head = &line[..line.find('%')?];
        let percent = head.split_whitespace().last()?.parse::<f32>().ok()?;
        Some((phase, percent))
    }
}

/// Kills the child if it was never reaped
struct ChildGuard {
    child: Child,
    tool: String,
    reaped: bool,
}

impl ChildGuard {
    fn wait(&mut self) -> std::io::Result<ExitStatus> {
        let status = self.child.wait()?;
        self.reaped = true;
        Ok(status)
    }
}

impl Drop for ChildGuard {
    fn drop(&mut self) {
        if !self.reaped {
            log::warn!("killing unfinished `{}` process", self.tool);
            if let Err(e) = self.child.kill() {
                log::warn!("failed to kill `{}`: {}", self.tool, e);
            }
            let _ = self.child.wait();
        }
    }
}

/// Verbatim copy of a tool's stdout; failure to write it is never fatal
struct DebugLog {
    path: PathBuf,
    inner: Option<BufWriter<File>>,
}

impl DebugLog {
    fn create(path: PathBuf) -> Self {
        let inner = path
            .parent()
            .map(std::fs::create_dir_all)
            .transpose()
            .and_then(|_| File::create(&path))
            .map(BufWriter::new);
        match inner {
            Ok(inner) => Self {
                path,
                inner: Some(inner),
            },
            Err(e) => {
                log::warn!("unable to create tool log {}: {}", path.display(), e);
                Self { path, inner: None }
            }
        }
    }

    fn line(&mut self, line: &str) {
        if let Some(w) = self.inner.as_mut() {
            if let Err(e) = writeln!(w, "{}", line) {
                log::warn!("unable to write tool log {}: {}", self.path.display(), e);
                self.inner = None;
            }
        }
    }
}

impl Drop for DebugLog {
    fn drop(&mut self) {
        if let Some(mut w) = self.inner.take() {
            let _ = w.flush();
        }
    }
}

/// Runs tools installed in `bin_dir`, with `scratch` as working directory
#[derive(Clone, Debug)]
pub struct ToolRunner {
    bin_dir: PathBuf,
    scratch: PathBuf,
    invocation: usize,
}

impl ToolRunner {
    pub fn new<P: Into<PathBuf>, S: Into<PathBuf>>(bin_dir: P, scratch: S) -> Self {
        Self {
            bin_dir: bin_dir.into(),
            scratch: scratch.into(),
            invocation: 0,
        }
    }

    pub fn executable(&self, tool: &str) -> PathBuf {
        self.bin_dir
            .join(format!("{}{}", tool, std::env::consts::EXE_SUFFIX))
    }

    /// Shared data directory of an installation, relative to its binaries
    pub fn data_path(&self) -> PathBuf {
        self.bin_dir.join("..").join("share").join("OpenMS")
    }

    fn command(&self, tool: &str) -> Command {
        let mut cmd = Command::new(self.executable(tool));
        cmd.current_dir(&self.scratch)
            .env("OPENMS_DATA_PATH", self.data_path())
            .stdin(Stdio::null());
        cmd
    }

    fn launch_failure(&self, tool: &str, source: std::io::Error) -> Error {
        log::error!(
            "failed to launch `{}` ({}): {}",
            tool,
            self.executable(tool).display(),
            source
        );
        Error::ToolLaunch {
            tool: tool.into(),
            source,
        }
    }

    /// Generate the default parameter document of `tool` at `path`
    pub fn materialize_defaults(&self, tool: &str, path: &Path) -> Result<()> {
        log::trace!("{} -write_ini {}", tool, path.display());
        let output = self
            .command(tool)
            .arg("-write_ini")
            .arg(path)
            .output()
            .map_err(|e| self.launch_failure(tool, e))?;

        if !output.status.success() {
            for line in String::from_utf8_lossy(&output.stderr).lines() {
                if !line.trim().is_empty() {
                    log::debug!("{}: {}", tool, line);
                }
            }
            return Err(Error::ToolExit {
                tool: tool.into(),
                code: output.status.code(),
            });
        }
        Ok(())
    }

    /// Run `tool` with the parameter document at `ini`, blocking until it exits
    pub fn run(&mut self, tool: &str, ini: &Path, progress: &mut dyn Progress) -> Result<()> {
        self.invocation += 1;
        log::trace!("{} -ini {}", tool, ini.display());

        let mut log = DebugLog::create(
            self.scratch
                .join("logs")
                .join(format!("{:02}-{}.log", self.invocation, tool)),
        );

        let child = self
            .command(tool)
            .arg("-ini")
            .arg(ini)
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()
            .map_err(|e| self.launch_failure(tool, e))?;

        let mut guard = ChildGuard {
            child,
            tool: tool.into(),
            reaped: false,
        };

        let stderr = guard.child.stderr.take().map(|mut stderr| {
            std::thread::spawn(move || {
                let mut buf = Vec::new();
                let _ = stderr.read_to_end(&mut buf);
                buf
            })
        });

        if let Some(stdout) = guard.child.stdout.take() {
            let mut scanner = ProgressScanner::default();
            let mut reader = BufReader::new(stdout);
            let mut buf = Vec::new();
            loop {
                buf.clear();
                let n = reader
                    .read_until(b'\n', &mut buf)
                    .map_err(|e| Error::ToolLaunch {
                        tool: tool.into(),
                        source: e,
                    })?;
                if n == 0 {
                    break;
                }
                let text = String::from_utf8_lossy(&buf);
                for line in text.trim_end_matches(['\n', '\r']).split('\r') {
                    log.line(line);
                    if let Some((phase, percent)) = scanner.scan(line) {
                        progress.status(tool, phase, percent);
                    }
                }
            }
        }

        let status = guard.wait().map_err(|e| Error::ToolLaunch {
            tool: tool.into(),
            source: e,
        })?;

        drain_stderr(tool, stderr);

        if status.success() {
            Ok(())
        } else {
            log::error!("`{}` exited with {}", tool, status);
            Err(Error::ToolExit {
                tool: tool.into(),
                code: status.code(),
            })
        }
    }
}

fn drain_stderr(tool: &str, handle: Option<JoinHandle<Vec<u8>>>) {
    let Some(handle) = handle else { return };
    match handle.join() {
        Ok(buf) => {
            for line in String::from_utf8_lossy(&buf).lines() {
                if !line.trim().is_empty() {
                    log::debug!("{}: {}", tool, line);
                }
            }
        }
        Err(_) => log::warn!("stderr reader for `{}` panicked", tool),
    }
}

impl Executor for ToolRunner {
    fn write_defaults(&mut self, tool: &str, ini: &Path) -> Result<()> {
        self.materialize_defaults(tool, ini)
    }

    fn execute(&mut self, tool: &str, ini: &Path, progress: &mut dyn Progress) -> Result<()> {
        self.run(tool, ini, progress)
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[derive(Default)]
    struct Recorder {
        status: Vec<(String, String, f32)>,
    }

    impl Progress for Recorder {
        fn status(&mut self, tool: &str, phase: &str, percent: f32) {
            self.status.push((tool.into(), phase.into(), percent));
        }

        fn fraction(&mut self, _: f64) {}
    }

    #[test]
    fn scan_progress_lines() {
        let mut scanner = ProgressScanner::default();
        assert_eq!(scanner.scan("  12.5 %"), None, "no phase yet");
        assert_eq!(scanner.scan("Progress of 'loading mzML file':"), None);
        assert_eq!(scanner.scan("  12.50 %"), Some(("loading mzML file", 12.5)));
        assert_eq!(scanner.scan("-- done [took 0.16 s (CPU), 0.16 s (Wall)] --"), None);
        assert_eq!(scanner.scan("abc %"), None);
        assert_eq!(scanner.scan("Progress of 'linking':"), None);
        assert_eq!(scanner.scan("100 %"), Some(("linking", 100.0)));
    }

    #[cfg(unix)]
    fn fake_tool(bin: &Path, name: &str, body: &str) {
        use std::os::unix::fs::PermissionsExt;
        let path = bin.join(name);
        std::fs::write(&path, format!("#!/bin/sh\n{}\n", body)).unwrap();
        std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o755)).unwrap();
    }

    // Scripts are written and executed from a single test so no concurrent
    // fork can hold them open for writing
    #[cfg(unix)]
    #[test]
    fn fake_tools() {
        let root = tempfile::tempdir().unwrap();
        let bin = root.path().join("bin");
        let scratch = root.path().join("scratch");
        std::fs::create_dir_all(&bin).unwrap();
        std::fs::create_dir_all(&scratch).unwrap();

        fake_tool(
            &bin,
            "Chatty",
            r#"echo "$OPENMS_DATA_PATH" > env.txt
echo "Progress of 'linking':"
printf '  10.00 %%\r  55.50 %%\r'
echo '  90 %'
echo 'oops' >&2
echo '' >&2
exit 0"#,
        );
        fake_tool(&bin, "Broken", "echo 'bad input' >&2\nexit 3");
        fake_tool(
            &bin,
            "Defaults",
            r#"if [ "$1" = "-write_ini" ]; then echo '<PARAMETERS/>' > "$2"; else exit 1; fi"#,
        );

        let mut runner = ToolRunner::new(&bin, &scratch);
        let mut rec = Recorder::default();
        let ini = scratch.join("x.ini");

        runner.run("Chatty", &ini, &mut rec).unwrap();
        assert_eq!(
            rec.status
                .iter()
                .map(|(_, phase, pct)| (phase.as_str(), *pct))
                .collect::<Vec<_>>(),
            vec![("linking", 10.0), ("linking", 55.5), ("linking", 90.0)]
        );
        let env = std::fs::read_to_string(scratch.join("env.txt")).unwrap();
        assert!(env.trim_end().ends_with("share/OpenMS"), "{}", env);
        let log = std::fs::read_to_string(scratch.join("logs").join("01-Chatty.log")).unwrap();
        assert!(log.contains("Progress of 'linking':"));
        assert!(log.contains("  55.50 %"));

        match runner.run("Broken", &ini, &mut rec) {
            Err(Error::ToolExit { tool, code }) => {
                assert_eq!(tool, "Broken");
                assert_eq!(code, Some(3));
            }
            other => panic!("expected exit failure, got {:?}", other),
        }
        assert!(scratch.join("logs").join("02-Broken.log").exists());

        assert!(matches!(
            runner.run("Missing", &ini, &mut rec),
            Err(Error::ToolLaunch { .. })
        ));

        let defaults = scratch.join("defaults.ini");
        runner.materialize_defaults("Defaults", &defaults).unwrap();
        assert!(defaults.exists());
        assert!(matches!(
            runner.materialize_defaults("Broken", &defaults),
            Err(Error::ToolExit { code: Some(3), .. })
        ));
        assert!(matches!(
            runner.materialize_defaults("Missing", &defaults),
            Err(Error::ToolLaunch { .. })
        ));

        // an unreaped child is killed when its guard goes away
        let alive = |pid: u32| {
            Command::new("kill")
                .arg("-0")
                .arg(pid.to_string())
                .stderr(Stdio::null())
                .status()
                .unwrap()
                .success()
        };
        let child = Command::new("sleep").arg("30").spawn().unwrap();
        let pid = child.id();
        assert!(alive(pid));
        let started = std::time::Instant::now();
        drop(ChildGuard {
            child,
            tool: "sleep".into(),
            reaped: false,
        });
        assert!(started.elapsed() < std::time::Duration::from_secs(10));
        assert!(!alive(pid));

        let mut reaped = ChildGuard {
            child: Command::new("true").spawn().unwrap(),
            tool: "true".into(),
            reaped: false,
        };
        assert!(reaped.wait().unwrap().success());
        drop(reaped);
    }

    #[test]
    fn data_path_is_relative_to_binaries() {
        let runner = ToolRunner::new("/opt/openms/bin", "/tmp");
        assert_eq!(
            runner.data_path(),
            Path::new("/opt/openms/bin/../share/OpenMS")
        );
    }
}
