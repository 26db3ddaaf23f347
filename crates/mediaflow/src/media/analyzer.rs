//! Speaker analysis engine seam
//!
//! The engine is one long-lived child process started with `--serve`. It prints
//! `{"ready": true}` once its models are loaded, then answers one JSON line per request:
//!
//! ```text
//! > {"audio_path": "/tmp/abc.wav"}
//! < {"result": {"raw_segments": [...], "merged_segments": [...], "speaker_count": 2}}
//! < {"result": null}            no speakers
//! < {"error": "out of memory"}  the request failed, the engine keeps running
//! ```

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::process::Stdio;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader, Lines};
use tokio::process::{Child, ChildStdin, ChildStdout, Command};
use tokio::sync::Mutex;

use crate::config::AnalysisConfig;
use crate::error::{Error, Result};
use crate::types::AnalysisResult;

/// Heavy analysis over a 16 kHz mono WAV
#[async_trait]
pub trait Analyzer: Send + Sync {
    /// Load models ahead of the first job
    async fn warm_up(&self) -> Result<()>;

    /// `None` when the audio contains no speakers
    async fn analyze(&self, wav: &Path) -> Result<Option<AnalysisResult>>;
}

#[derive(Serialize)]
struct Request<'a> {
    audio_path: &'a Path,
}

#[derive(Deserialize)]
struct Ready {
    #[serde(default)]
    ready: bool,
}

#[derive(Debug, Deserialize)]
struct Reply {
    #[serde(default)]
    result: Option<AnalysisResult>,
    #[serde(default)]
    error: Option<String>,
}

/// Running engine process
struct Session {
    program: String,
    child: Child,
    stdin: ChildStdin,
    lines: Lines<BufReader<ChildStdout>>,
}

impl Session {
    async fn next_line(&mut self) -> Result<String> {
        self.lines
            .next_line()
            .await?
            .ok_or_else(|| Error::tool(self.program.clone(), "engine closed its output"))
    }

    async fn request(&mut self, wav: &Path) -> Result<Reply> {
        let mut line = serde_json::to_vec(&Request { audio_path: wav })?;
        line.push(b'\n');
        self.stdin.write_all(&line).await?;
        self.stdin.flush().await?;

        let reply = self.next_line().await?;
        Ok(serde_json::from_str(&reply)?)
    }
}

/// [`Analyzer`] over a persistent engine process.
///
/// The process is started on warm-up or on the first request and reused after that. A
/// broken pipe or an unreadable reply drops it, and the next request starts a new one.
pub struct CommandAnalyzer {
    program: String,
    args: Vec<String>,
    session: Mutex<Option<Session>>,
}

impl CommandAnalyzer {
    pub fn new(config: &AnalysisConfig) -> Self {
        Self {
            program: config.command.clone(),
            args: config.args.clone(),
            session: Mutex::new(None),
        }
    }

    async fn spawn(&self) -> Result<Session> {
        let mut child = Command::new(&self.program)
            .args(&self.args)
            .arg("--serve")
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::inherit())
            .kill_on_drop(true)
            .spawn()?;

        let stdin = child
            .stdin
            .take()
            .ok_or_else(|| Error::internal("engine stdin is not piped"))?;
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| Error::internal("engine stdout is not piped"))?;
        let mut session = Session {
            program: self.program.clone(),
            child,
            stdin,
            lines: BufReader::new(stdout).lines(),
        };

        let ready: Ready = serde_json::from_str(&session.next_line().await?)?;
        if !ready.ready {
            return Err(Error::tool(self.program.clone(), "engine did not report ready"));
        }
        tracing::info!(
            "Analysis engine {} ready (pid {:?})",
            self.program,
            session.child.id()
        );
        Ok(session)
    }
}

#[async_trait]
impl Analyzer for CommandAnalyzer {
    async fn warm_up(&self) -> Result<()> {
        let mut slot = self.session.lock().await;
        if slot.is_none() {
            *slot = Some(self.spawn().await?);
        }
        Ok(())
    }

    async fn analyze(&self, wav: &Path) -> Result<Option<AnalysisResult>> {
        let mut slot = self.session.lock().await;
        let mut session = match slot.take() {
            Some(session) => session,
            None => self.spawn().await?,
        };

        // On error the session is dropped here, which kills the process
        let reply = session.request(wav).await?;
        *slot = Some(session);

        match reply.error {
            Some(message) => Err(Error::tool(self.program.clone(), message)),
            None => Ok(reply.result),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Engine numbering its replies so tests can tell whether the process was reused
    const ENGINE: &str = r#"
        echo '{"ready": true}'
        n=0
        while read -r line; do
            case "$line" in
                *silence*) echo '{"result": null}' ;;
                *corrupt*) echo '{"error": "cannot decode audio"}' ;;
                *crash*) exit 3 ;;
                *)
                    n=$((n + 1))
                    printf '{"result": {"raw_segments": [], "merged_segments": [], "speaker_count": %d}}\n' "$n"
                    ;;
            esac
        done
    "#;

    fn engine() -> CommandAnalyzer {
        CommandAnalyzer::new(&AnalysisConfig {
            command: "sh".to_string(),
            args: vec!["-c".to_string(), ENGINE.to_string()],
            ..Default::default()
        })
    }

    fn speakers(result: Option<AnalysisResult>) -> usize {
        result.map(|r| r.speaker_count).unwrap_or(0)
    }

    #[tokio::test]
    async fn test_requests_share_one_process() {
        let analyzer = engine();
        analyzer.warm_up().await.unwrap();
        let pid = analyzer.session.lock().await.as_ref().unwrap().child.id();

        let first = analyzer.analyze(Path::new("/tmp/a.wav")).await.unwrap();
        let second = analyzer.analyze(Path::new("/tmp/b.wav")).await.unwrap();
        assert_eq!(speakers(first), 1);
        assert_eq!(speakers(second), 2);
        assert_eq!(analyzer.session.lock().await.as_ref().unwrap().child.id(), pid);
    }

    #[tokio::test]
    async fn test_null_result_and_engine_error() {
        let analyzer = engine();
        assert!(analyzer
            .analyze(Path::new("/tmp/silence.wav"))
            .await
            .unwrap()
            .is_none());

        let err = analyzer
            .analyze(Path::new("/tmp/corrupt.wav"))
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Tool { ref message, .. } if message == "cannot decode audio"));

        // A failed request leaves the engine running
        let result = analyzer.analyze(Path::new("/tmp/a.wav")).await.unwrap();
        assert_eq!(speakers(result), 1);
    }

    #[tokio::test]
    async fn test_engine_exit_starts_a_new_process() {
        let analyzer = engine();
        analyzer.analyze(Path::new("/tmp/a.wav")).await.unwrap();

        assert!(analyzer.analyze(Path::new("/tmp/crash.wav")).await.is_err());
        assert!(analyzer.session.lock().await.is_none());

        // Counter restarts in the new process
        let result = analyzer.analyze(Path::new("/tmp/b.wav")).await.unwrap();
        assert_eq!(speakers(result), 1);
    }
}
