use std::path::{Path, PathBuf};
use std::process::Stdio;

use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::Command;

/// Receives each console line as soon as the solver prints it.
pub type LineSink<'a> = &'a mut (dyn FnMut(&str) + Send);

pub const THREADS_ENV: &str = "OMP_NUM_THREADS";
pub const SOLVER_THREADS_ENV: &str = "CCX_NPROC_EQUATION_SOLVER";
const LOCAL_FALLBACK: &str = "./bin/ccx";

#[derive(Debug, Clone, PartialEq)]
pub struct SolveOutcome {
    pub success: bool,
    pub exit_code: Option<i32>,
    /// `<job>.dat` in the working directory; may not exist on failure
    pub report: PathBuf,
}

impl SolveOutcome {
    pub fn failed(report: PathBuf) -> Self {
        Self {
            success: false,
            exit_code: None,
            report,
        }
    }
}

/// Boundary to the external solver process.
#[allow(async_fn_in_trait)]
pub trait SolverPort {
    async fn run(
        &self,
        deck: &Path,
        work_dir: &Path,
        threads: usize,
        on_line: LineSink<'_>,
    ) -> SolveOutcome;
}

/// Runs the CalculiX `ccx` executable.
pub struct CalculixRunner {
    executable: String,
}

impl CalculixRunner {
    pub fn new(executable: impl Into<String>) -> Self {
        Self {
            executable: executable.into(),
        }
    }
}

impl SolverPort for CalculixRunner {
    async fn run(
        &self,
        deck: &Path,
        work_dir: &Path,
        threads: usize,
        on_line: LineSink<'_>,
    ) -> SolveOutcome {
        // ccx expects the job name without extension
        let job_name = deck
            .file_stem()
            .map(|s| s.to_string_lossy().to_string())
            .unwrap_or_default();
        let report = work_dir.join(format!("{}.dat", job_name));

        let Some(program) = resolve_executable(&self.executable) else {
            on_line(&format!(
                "ERROR: CalculiX executable '{}' not found (set CALCULIX_PATH)",
                self.executable
            ));
            return SolveOutcome::failed(report);
        };

        let threads = threads.max(1).to_string();
        tracing::info!("Running command: {} {} (threads={})", program.display(), job_name, threads);

        let spawned = Command::new(&program)
            .arg(&job_name)
            .current_dir(work_dir)
            .env(THREADS_ENV, &threads)
            .env(SOLVER_THREADS_ENV, &threads)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn();

        let mut child = match spawned {
            Ok(child) => child,
            Err(e) => {
                on_line(&format!("ERROR: failed to execute {}: {}", program.display(), e));
                return SolveOutcome::failed(report);
            }
        };

        let mut stdout = child.stdout.take().map(BufReader::new);
        let mut stderr = child.stderr.take().map(BufReader::new);
        let mut stdout_buf = Vec::new();
        let mut stderr_buf = Vec::new();

        while stdout.is_some() || stderr.is_some() {
            tokio::select! {
                line = next_line(&mut stdout, &mut stdout_buf), if stdout.is_some() => match line {
                    Some(line) => on_line(&line),
                    None => stdout = None,
                },
                line = next_line(&mut stderr, &mut stderr_buf), if stderr.is_some() => match line {
                    Some(line) => on_line(&line),
                    None => stderr = None,
                },
            }
        }

        match child.wait().await {
            Ok(status) => {
                if !status.success() {
                    on_line(&format!("ERROR: CalculiX exited with status {}", status));
                }
                SolveOutcome {
                    success: status.success(),
                    exit_code: status.code(),
                    report,
                }
            }
            Err(e) => {
                on_line(&format!("ERROR: failed waiting for CalculiX: {}", e));
                SolveOutcome::failed(report)
            }
        }
    }
}

/// Next console line, decoded lossily so stray non-UTF-8 bytes never end the
/// stream. Bytes of an interrupted read stay in `buf` for the next call.
async fn next_line<R>(reader: &mut Option<R>, buf: &mut Vec<u8>) -> Option<String>
where
    R: tokio::io::AsyncBufRead + Unpin,
{
    let reader = reader.as_mut()?;
    match reader.read_until(b'\n', buf).await {
        Ok(0) if buf.is_empty() => None,
        Ok(_) => {
            while matches!(buf.last(), Some(b'\n' | b'\r')) {
                buf.pop();
            }
            let line = String::from_utf8_lossy(buf).into_owned();
            buf.clear();
            Some(line)
        }
        Err(e) => {
            tracing::warn!("Reading solver output failed: {}", e);
            None
        }
    }
}

/// Absolute path, then PATH lookup, then the repo-local `./bin/ccx`.
pub fn resolve_executable(configured: &str) -> Option<PathBuf> {
    let candidate = Path::new(configured);
    if candidate.is_absolute() {
        return candidate.is_file().then(|| candidate.to_path_buf());
    }
    if candidate.components().count() > 1 && candidate.is_file() {
        return std::fs::canonicalize(candidate).ok();
    }

    if let Some(paths) = std::env::var_os("PATH") {
        for dir in std::env::split_paths(&paths) {
            let full = dir.join(configured);
            if full.is_file() {
                return Some(full);
            }
            if cfg!(windows) {
                let exe = dir.join(format!("{}.exe", configured));
                if exe.is_file() {
                    return Some(exe);
                }
            }
        }
    }

    let local = Path::new(LOCAL_FALLBACK);
    if local.is_file() {
        return std::fs::canonicalize(local).ok();
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_missing_executable_is_none() {
        assert_eq!(resolve_executable("/definitely/not/here/ccx"), None);
        assert_eq!(resolve_executable("ccx-does-not-exist-anywhere"), None);
    }

    #[tokio::test]
    async fn test_launch_failure_reported_through_sink() {
        let dir = tempfile::tempdir().unwrap();
        let deck = dir.path().join("job_1.inp");
        let runner = CalculixRunner::new("/definitely/not/here/ccx");
        let mut lines = Vec::new();
        let mut sink = |l: &str| lines.push(l.to_string());
        let outcome = runner.run(&deck, dir.path(), 2, &mut sink).await;
        assert!(!outcome.success);
        assert_eq!(outcome.report, dir.path().join("job_1.dat"));
        assert!(lines[0].starts_with("ERROR:"));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_streams_lines_and_exit_status() {
        use std::os::unix::fs::PermissionsExt;

        let dir = tempfile::tempdir().unwrap();
        let script = dir.path().join("fake_ccx.sh");
        std::fs::write(
            &script,
            "#!/bin/sh\necho \"job $1 threads $OMP_NUM_THREADS\"\necho warn 1>&2\nexit 3\n",
        )
        .unwrap();
        std::fs::set_permissions(&script, std::fs::Permissions::from_mode(0o755)).unwrap();

        let runner = CalculixRunner::new(script.to_string_lossy().to_string());
        let mut lines = Vec::new();
        let mut sink = |l: &str| lines.push(l.to_string());
        let outcome = runner
            .run(&dir.path().join("beam_a.inp"), dir.path(), 4, &mut sink)
            .await;

        assert!(!outcome.success);
        assert_eq!(outcome.exit_code, Some(3));
        assert!(lines.contains(&"job beam_a threads 4".to_string()));
        assert!(lines.contains(&"warn".to_string()));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_invalid_utf8_line_keeps_stream_open() {
        use std::os::unix::fs::PermissionsExt;

        let dir = tempfile::tempdir().unwrap();
        let script = dir.path().join("fake_ccx.sh");
        std::fs::write(
            &script,
            "#!/bin/sh\necho before\nprintf 'bad \\377 byte\\n'\n\
             i=0\nwhile [ $i -lt 20000 ]; do echo \"line $i\"; i=$((i+1)); done\nexit 0\n",
        )
        .unwrap();
        std::fs::set_permissions(&script, std::fs::Permissions::from_mode(0o755)).unwrap();

        let runner = CalculixRunner::new(script.to_string_lossy().to_string());
        let mut lines = Vec::new();
        let mut sink = |l: &str| lines.push(l.to_string());
        let outcome = runner
            .run(&dir.path().join("job.inp"), dir.path(), 1, &mut sink)
            .await;

        assert!(outcome.success);
        assert_eq!(outcome.exit_code, Some(0));
        assert_eq!(lines.len(), 20_002);
        assert_eq!(lines[0], "before");
        assert_eq!(lines[1], "bad \u{FFFD} byte");
        assert_eq!(lines.last().map(String::as_str), Some("line 19999"));
    }
}
