//! Session state machine
//!
//! `AwaitingLogin -> AwaitingProjectSelection -> AwaitingSubmissionSetup ->
//! StreamingFiles -> Closed`
//!
//! Every session ends with exactly one final `OK` or `ERROR: <message>`
//! frame, after which the connection is shut down.

use std::collections::BTreeMap;

use tokio::io::{AsyncRead, AsyncWrite};
use tracing::{debug, info, warn};

use super::codec::{ContinueReply, Connection, Credentials, NewSubmission, Request, SendFile};
use crate::core::credentials;
use crate::core::models::{File, FileId, FileType, Mode, Permission, Submission, SubmissionId, User};
use crate::error::{ProtocolError, SessionError};
use crate::monitor::ActiveGuard;
use crate::state::AppState;
use crate::store::StoreError;

enum Setup {
    New(NewSubmission),
    Continue(SubmissionId),
}

enum State {
    AwaitingLogin,
    AwaitingProjectSelection {
        user: User,
        mode: Mode,
    },
    AwaitingSubmissionSetup {
        user: User,
        mode: Mode,
        setup: Setup,
    },
    StreamingFiles {
        submission: Submission,
        /// Ordinal of the next received file
        next: u64,
        /// Keeps the submission in the monitor's active set
        active: ActiveGuard,
    },
    Closed,
}

pub struct Session<S> {
    conn: Connection<S>,
    app: AppState,
    peer: String,
}

impl<S: AsyncRead + AsyncWrite + Unpin> Session<S> {
    pub fn new(stream: S, peer: impl Into<String>, app: AppState) -> Self {
        Self {
            conn: Connection::new(stream, &app.config.server),
            app,
            peer: peer.into(),
        }
    }

    /// Drive the session to completion and close the connection
    pub async fn start(mut self) {
        debug!("[{}] Session started", self.peer);
        let result = self.run().await;
        self.end(result).await;
    }

    async fn run(&mut self) -> Result<(), SessionError> {
        let mut state = State::AwaitingLogin;
        loop {
            state = match state {
                State::AwaitingLogin => self.login().await?,
                State::AwaitingProjectSelection { user, mode } => {
                    self.select_project(user, mode).await?
                }
                State::AwaitingSubmissionSetup { user, mode, setup } => {
                    self.setup(user, mode, setup).await?
                }
                State::StreamingFiles {
                    submission,
                    next,
                    active,
                } => self.stream(submission, next, active).await?,
                State::Closed => return Ok(()),
            };
        }
    }

    async fn end(mut self, result: Result<(), SessionError>) {
        let sent = match &result {
            Ok(()) => {
                info!("[{}] Session closed", self.peer);
                self.conn.write_ok().await
            }
            Err(e) => {
                if e.is_disconnect() {
                    info!("[{}] Session ended: {}", self.peer, e);
                } else {
                    warn!("[{}] Session failed: {}", self.peer, e);
                }
                self.conn.write_error(&e.client_message()).await
            }
        };
        if let Err(e) = sent {
            debug!("[{}] Could not send final status: {}", self.peer, e);
        }
        if let Err(e) = self.conn.shutdown().await {
            debug!("[{}] Shutdown failed: {}", self.peer, e);
        }
    }

    async fn login(&mut self) -> Result<State, SessionError> {
        let (user, mode) = match self.conn.read_request().await? {
            Request::Login(creds) => (self.authenticate(&creds).await?, creds.mode),
            Request::Register(creds) => (self.register(&creds).await?, creds.mode),
            Request::Logout => return Ok(State::Closed),
            other => return Err(unexpected(&other, "awaiting login")),
        };
        info!(
            "[{}] {} logged in (mode {}, level {})",
            self.peer,
            user.name,
            mode,
            user.permission.name()
        );

        let projects = self.app.store.projects().await?;
        self.conn.write_json(&projects).await?;
        Ok(State::AwaitingProjectSelection { user, mode })
    }

    async fn authenticate(&self, creds: &Credentials) -> Result<User, SessionError> {
        let user = self
            .app
            .store
            .user(&creds.user)
            .await?
            .ok_or_else(|| SessionError::Auth(creds.user.clone()))?;
        check_mode(&user, creds.mode)?;
        if !credentials::validate(&user.password, &user.salt, &creds.password) {
            return Err(SessionError::Credential(creds.user.clone()));
        }
        Ok(user)
    }

    async fn register(&self, creds: &Credentials) -> Result<User, SessionError> {
        if !self.app.config.server.allow_registration {
            return Err(SessionError::Permission("registration is disabled".into()));
        }
        if creds.user.trim().is_empty() || creds.password.is_empty() {
            return Err(ProtocolError::Malformed("user name and password are required".into()).into());
        }

        let user = credentials::new_user(creds.user.trim(), &creds.password, Permission::FILE)?;
        match self.app.store.add_user(&user).await {
            Ok(()) => {}
            Err(StoreError::Duplicate { .. }) => return Err(SessionError::UserExists(user.name)),
            Err(e) => return Err(e.into()),
        }
        info!("[{}] Registered user {}", self.peer, user.name);
        check_mode(&user, creds.mode)?;
        Ok(user)
    }

    async fn select_project(&mut self, user: User, mode: Mode) -> Result<State, SessionError> {
        let setup = match self.conn.read_request().await? {
            Request::SubmissionNew(new) => Setup::New(new),
            Request::SubmissionContinue(cont) => Setup::Continue(cont.submission),
            Request::Logout => return Ok(State::Closed),
            other => return Err(unexpected(&other, "awaiting project selection")),
        };
        Ok(State::AwaitingSubmissionSetup { user, mode, setup })
    }

    /// A missing project or submission is reported without ending the
    /// session, the client may try again.
    async fn setup(&mut self, user: User, mode: Mode, setup: Setup) -> Result<State, SessionError> {
        let resumed = matches!(setup, Setup::Continue(_));
        let opened = match setup {
            Setup::New(new) => self.create(&user, mode, &new).await,
            Setup::Continue(id) => self.resume(&user, &id).await,
        };
        let (submission, next) = match opened {
            Ok(opened) => opened,
            Err(e @ SessionError::NotFound(_)) => {
                warn!("[{}] Submission setup failed: {}", self.peer, e);
                self.conn.write_error(&e.client_message()).await?;
                return Ok(State::AwaitingProjectSelection { user, mode });
            }
            Err(e) => return Err(e),
        };

        let active = self.app.monitor.track(submission.id);
        if resumed {
            info!(
                "[{}] {} continues submission {} at file {}",
                self.peer, user.name, submission.id, next
            );
            let reply = ContinueReply {
                submission: submission.clone(),
                file_count: next,
            };
            self.conn.write_json(&reply).await?;
        } else {
            info!(
                "[{}] {} opened submission {} for project {}",
                self.peer, user.name, submission.id, submission.project
            );
            self.conn.write_json(&submission).await?;
        }

        Ok(State::StreamingFiles {
            submission,
            next,
            active,
        })
    }

    async fn create(&self, user: &User, mode: Mode, new: &NewSubmission) -> Result<(Submission, u64), SessionError> {
        let project = self
            .app
            .store
            .project(&new.project)
            .await?
            .ok_or_else(|| SessionError::NotFound(format!("project {}", new.project)))?;
        let submission = Submission::new(&user.name, project.id, mode, new.time);
        self.app.store.add_submission(&submission).await?;
        Ok((submission, 0))
    }

    async fn resume(&self, user: &User, id: &SubmissionId) -> Result<(Submission, u64), SessionError> {
        // Other users' submissions are reported as missing
        let submission = self
            .app
            .store
            .submission(id)
            .await?
            .filter(|s| s.user == user.name)
            .ok_or_else(|| SessionError::NotFound(format!("submission {}", id)))?;
        check_mode(user, submission.mode)?;
        let count = self.app.store.file_count(id).await?;
        Ok((submission, count))
    }

    async fn stream(&mut self, submission: Submission, next: u64, active: ActiveGuard) -> Result<State, SessionError> {
        match self.conn.read_request().await? {
            Request::Send(meta) => {
                self.receive(&submission, next, &meta).await?;
                Ok(State::StreamingFiles {
                    submission,
                    next: next + 1,
                    active,
                })
            }
            Request::Logout => {
                info!(
                    "[{}] Submission {} closed after {} files",
                    self.peer, submission.id, next
                );
                Ok(State::Closed)
            }
            other => Err(unexpected(&other, "streaming files")),
        }
    }

    /// Ack, payload, persist, hand over, ack
    async fn receive(&mut self, submission: &Submission, number: u64, meta: &SendFile) -> Result<(), SessionError> {
        let resolved = match submission.mode {
            Mode::FileRemote | Mode::Update => Some(meta.resolve()?),
            Mode::ArchiveRemote | Mode::ArchiveTest => None,
        };

        self.conn.write_ok().await?;
        let data = self.conn.read_payload().await?;

        let file = match resolved {
            Some(meta) => File {
                id: FileId::new(),
                submission: submission.id,
                number,
                name: meta.name,
                package: meta.package,
                kind: meta.kind,
                modification: meta.modification,
                time: meta.time,
                data,
                results: BTreeMap::new(),
            },
            None => {
                let mut file = File::archive(submission.id, number, data);
                if submission.mode == Mode::ArchiveTest {
                    file.kind = FileType::Test;
                }
                file
            }
        };
        self.app.store.add_file(&file).await?;
        debug!("[{}] Stored {} ({} bytes)", self.peer, file, file.data.len());

        self.app.pipeline.submit(file).await?;
        self.conn.write_ok().await
    }
}

fn check_mode(user: &User, mode: Mode) -> Result<(), SessionError> {
    if user.permission.allows(mode) {
        Ok(())
    } else {
        Err(SessionError::Permission(format!(
            "user {} ({} access) may not submit in mode {}",
            user.name,
            user.permission.name(),
            mode
        )))
    }
}

fn unexpected(request: &Request, state: &'static str) -> SessionError {
    ProtocolError::Unexpected {
        got: request.name().to_string(),
        state,
    }
    .into()
}
