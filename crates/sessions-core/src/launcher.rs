//! Starting the external OTF processing command.
//!
//! The command template comes from the registry config
//! (`otf.command.<instrument>`) and may use `{otf_path}` and `{session_id}`.
//! It runs through `sh -c` inside the workspace and is not waited for: only
//! the spawn itself can fail the launch. A reaper thread logs the exit.

use std::process::{Command, Stdio};
use std::sync::Arc;

use tracing::{info, warn};

use crate::error::{Result, SessionsError};
use crate::registry::Registry;
use crate::template;
use crate::types::{Resources, Session};

pub trait OtfLauncher: Send + Sync {
    fn launch(&self, session: &Session) -> Result<()>;
}

pub struct CommandLauncher {
    registry: Arc<dyn Registry>,
    resources: Arc<Resources>,
}

impl CommandLauncher {
    pub fn new(registry: Arc<dyn Registry>, resources: Arc<Resources>) -> Self {
        Self {
            registry,
            resources,
        }
    }

    /// Render the launch command line for `session`.
    pub fn command_line(&self, session: &Session) -> Result<String> {
        let microscope = self.resources.name(session.resource_id)?;
        let otf_path = session
            .extra
            .otf
            .as_ref()
            .and_then(|o| o.path())
            .ok_or_else(|| {
                SessionsError::Launch(format!("session {} has no OTF workspace", session.id))
            })?;

        let config = self.registry.sessions_config()?;
        let vars = template::vars([
            ("otf_path", otf_path.display().to_string()),
            ("session_id", session.id.to_string()),
            ("microscope", microscope.to_string()),
        ]);
        template::render(config.command_for(microscope)?, &vars)
    }
}

impl OtfLauncher for CommandLauncher {
    fn launch(&self, session: &Session) -> Result<()> {
        let cmd = self.command_line(session)?;
        let workdir = session
            .extra
            .otf
            .as_ref()
            .and_then(|o| o.path())
            .filter(|p| p.is_dir())
            .map(|p| p.to_path_buf());

        info!(session_id = session.id, command = %cmd, "launching OTF");
        let mut command = Command::new("sh");
        command
            .arg("-c")
            .arg(&cmd)
            .stdin(Stdio::null())
            .stdout(Stdio::inherit())
            .stderr(Stdio::inherit());
        if let Some(dir) = workdir {
            command.current_dir(dir);
        }
        let mut child = command
            .spawn()
            .map_err(|e| SessionsError::Launch(format!("failed to spawn '{cmd}': {e}")))?;

        let session_id = session.id;
        std::thread::Builder::new()
            .name(format!("otf-{session_id}"))
            .spawn(move || match child.wait() {
                Ok(status) if status.success() => {
                    info!(session_id, "OTF command finished")
                }
                Ok(status) => warn!(session_id, %status, "OTF command exited with failure"),
                Err(e) => warn!(session_id, error = %e, "could not wait for OTF command"),
            })?;
        Ok(())
    }
}
