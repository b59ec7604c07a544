// SPDX-License-Identifier: AGPL-3.0
// Ftper Core - FTP transport
//
// Plain FTP in passive mode. Each session logs in once and then moves
// files over fresh data connections, resuming with REST when the server
// announces REST STREAM and starting over when it does not.

use super::codec::{self, ControlChannel, Reply};
use super::listing;
use super::{RemoteEntry, TransferJob, TransferProgress, Transport, TransportSession};
use crate::profiles::Profile;
use crate::task::Direction;
use crate::types::TransportError;
use async_trait::async_trait;
use std::io::SeekFrom;
use std::net::{IpAddr, SocketAddr};
use std::time::Duration;
use tokio::fs::{File, OpenOptions};
use tokio::io::{AsyncReadExt, AsyncSeekExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::time::timeout;
use tokio_util::sync::CancellationToken;

/// How long to wait for the server to settle after ABOR or QUIT
const GOODBYE_TIMEOUT: Duration = Duration::from_secs(2);

/// FTP transport configuration
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FtpConfig {
    pub connect_timeout: Duration,
    /// Bounds each data connect and every read or write stall
    pub data_timeout: Duration,
    /// Continue interrupted transfers with REST
    pub resume: bool,
}

impl Default for FtpConfig {
    fn default() -> Self {
        Self {
            connect_timeout: Duration::from_secs(5),
            data_timeout: Duration::from_secs(30),
            resume: true,
        }
    }
}

pub struct FtpTransport {
    config: FtpConfig,
}

impl FtpTransport {
    pub fn new(config: FtpConfig) -> Self {
        Self { config }
    }
}

impl Default for FtpTransport {
    fn default() -> Self {
        Self::new(FtpConfig::default())
    }
}

#[async_trait]
impl Transport for FtpTransport {
    fn supports_resume(&self) -> bool {
        self.config.resume
    }

    async fn open(&self, profile: &Profile) -> Result<Box<dyn TransportSession>, TransportError> {
        let session = FtpSession::connect(profile, self.config.clone()).await?;
        Ok(Box::new(session))
    }
}

/// Extensions announced by FEAT
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
struct Features {
    size: bool,
    rest_stream: bool,
    epsv: bool,
}

impl Features {
    fn from_reply(reply: &Reply) -> Self {
        let mut features = Features::default();
        // the first and last lines are the 211 framing
        for line in reply.lines.iter().skip(1) {
            let feature = line.trim().to_ascii_uppercase();
            if feature == "SIZE" {
                features.size = true;
            } else if feature == "REST STREAM" {
                features.rest_stream = true;
            } else if feature == "EPSV" {
                features.epsv = true;
            }
        }
        features
    }
}

struct FtpSession {
    control: ControlChannel<TcpStream>,
    peer_ip: IpAddr,
    config: FtpConfig,
    features: Features,
}

impl FtpSession {
    async fn connect(profile: &Profile, config: FtpConfig) -> Result<Self, TransportError> {
        let address = format!("{}:{}", profile.host.trim_matches(['[', ']']), profile.port);
        tracing::info!("Connecting to {} as {}", address, profile.username);

        let stream = timeout(
            config.connect_timeout,
            TcpStream::connect((profile.host.trim_matches(['[', ']']), profile.port)),
        )
        .await
        .map_err(|_| TransportError::Connect(format!("connection to {} timed out", address)))?
        .map_err(|e| TransportError::Connect(format!("cannot reach {}: {}", address, e)))?;

        let peer_ip = stream
            .peer_addr()
            .map_err(|e| TransportError::Connect(e.to_string()))?
            .ip();
        let mut control = ControlChannel::new(stream);

        let banner = timeout(config.connect_timeout, control.read_reply())
            .await
            .map_err(|_| TransportError::Connect("no greeting from server".to_string()))?
            .map_err(connect_error)?;
        if !banner.is_success() {
            return Err(TransportError::Connect(format!("server refused: {}", banner)));
        }

        Self::login(&mut control, profile).await?;

        let feat = control.execute("FEAT").await.map_err(connect_error)?;
        let features = if feat.is_success() {
            Features::from_reply(&feat)
        } else {
            Features::default()
        };
        tracing::debug!("Server features: {:?}", features);

        control.expect("TYPE I", 2).await.map_err(connect_error)?;

        Ok(Self {
            control,
            peer_ip,
            config,
            features,
        })
    }

    async fn login(
        control: &mut ControlChannel<TcpStream>,
        profile: &Profile,
    ) -> Result<(), TransportError> {
        let user = control
            .execute(&format!("USER {}", profile.username))
            .await
            .map_err(connect_error)?;

        let reply = if user.is_intermediate() {
            control
                .execute(&format!("PASS {}", profile.credential_secret))
                .await
                .map_err(connect_error)?
        } else {
            user
        };

        if !reply.is_success() {
            return Err(TransportError::Connect(format!("login failed: {}", reply)));
        }
        Ok(())
    }

    /// Negotiate a passive data connection
    async fn open_data(&mut self) -> Result<TcpStream, TransportError> {
        let mut addr = None;

        if self.features.epsv {
            let reply = self.control.execute("EPSV").await?;
            if reply.code == 229 {
                addr = Some(SocketAddr::new(self.peer_ip, codec::parse_epsv(&reply)?));
            }
        }

        let addr = match addr {
            Some(addr) => addr,
            None => {
                let reply = self.control.expect("PASV", 2).await?;
                let announced = codec::parse_pasv(&reply)?;
                // servers behind NAT announce their private address; trust the control peer
                SocketAddr::new(self.peer_ip, announced.port())
            }
        };

        tracing::trace!("Opening data connection to {}", addr);
        timeout(self.config.data_timeout, TcpStream::connect(addr))
            .await
            .map_err(|_| TransportError::Transfer("timeout".to_string()))?
            .map_err(TransportError::from)
    }

    /// Issue REST (when resuming) and the data command, then wait for 1xx
    async fn start_command(
        &mut self,
        verb: &str,
        path: &str,
        offset: u64,
    ) -> Result<(), TransportError> {
        if offset > 0 {
            self.control.expect(&format!("REST {}", offset), 3).await?;
        }

        let reply = self.control.execute(&format!("{} {}", verb, path)).await?;
        if !reply.is_preliminary() {
            return Err(TransportError::Transfer(format!("{} failed: {}", verb, reply)));
        }
        Ok(())
    }

    async fn finish_command(&mut self) -> Result<(), TransportError> {
        let reply = timeout(self.config.data_timeout, self.control.read_reply())
            .await
            .map_err(|_| TransportError::Transfer("timeout".to_string()))??;
        if !reply.is_success() {
            return Err(TransportError::Transfer(format!(
                "transfer rejected: {}",
                reply
            )));
        }
        Ok(())
    }

    /// Tell the server to drop the transfer and swallow its replies
    async fn abort(&mut self) {
        if self.control.send("ABOR").await.is_err() {
            return;
        }
        // 426 for the interrupted transfer, then 226 for ABOR; some servers send only one
        for _ in 0..2 {
            match timeout(GOODBYE_TIMEOUT, self.control.read_reply()).await {
                Ok(Ok(reply)) if reply.code == 226 || reply.code == 225 => break,
                Ok(Ok(_)) => continue,
                _ => break,
            }
        }
    }

    async fn size(&mut self, remote_path: &str) -> Option<u64> {
        if !self.features.size {
            return None;
        }
        match self.control.execute(&format!("SIZE {}", remote_path)).await {
            Ok(reply) if reply.code == 213 => reply.message().parse().ok(),
            _ => None,
        }
    }

    async fn upload(
        &mut self,
        job: &TransferJob,
        progress: &(dyn Fn(TransferProgress) + Send + Sync),
        cancel: &CancellationToken,
    ) -> Result<u64, TransportError> {
        let mut file = File::open(&job.local_path).await.map_err(|e| {
            TransportError::Transfer(format!("cannot open {}: {}", job.local_path.display(), e))
        })?;
        let total = file.metadata().await?.len();
        if job.offset > total {
            return Err(TransportError::Transfer(
                "local file is shorter than the resume offset".to_string(),
            ));
        }
        file.seek(SeekFrom::Start(job.offset)).await?;

        let mut data = self.open_data().await?;
        self.start_command("STOR", &job.remote_path, job.offset).await?;

        let result = codec::pump(
            &mut file,
            &mut data,
            job.offset,
            Some(total),
            progress,
            cancel,
            self.config.data_timeout,
        )
        .await;

        match result {
            Ok(sent) => {
                // closing the data connection marks end of file
                let _ = data.shutdown().await;
                drop(data);
                self.finish_command().await?;
                Ok(sent)
            }
            Err(e) => {
                drop(data);
                if e == TransportError::Cancelled {
                    self.abort().await;
                }
                Err(e)
            }
        }
    }

    async fn download(
        &mut self,
        job: &TransferJob,
        progress: &(dyn Fn(TransferProgress) + Send + Sync),
        cancel: &CancellationToken,
    ) -> Result<u64, TransportError> {
        let total = self.size(&job.remote_path).await;

        if let Some(parent) = job.local_path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        let mut file = OpenOptions::new()
            .create(true)
            .write(true)
            .truncate(job.offset == 0)
            .open(&job.local_path)
            .await
            .map_err(|e| {
                TransportError::Transfer(format!(
                    "cannot write {}: {}",
                    job.local_path.display(),
                    e
                ))
            })?;
        if job.offset > 0 {
            // drop anything past the confirmed offset
            file.set_len(job.offset).await?;
            file.seek(SeekFrom::Start(job.offset)).await?;
        }

        let mut data = self.open_data().await?;
        self.start_command("RETR", &job.remote_path, job.offset).await?;

        let result = codec::pump(
            &mut data,
            &mut file,
            job.offset,
            total,
            progress,
            cancel,
            self.config.data_timeout,
        )
        .await;

        drop(data);
        file.flush().await?;

        match result {
            Ok(received) => {
                self.finish_command().await?;
                Ok(received)
            }
            Err(e) => {
                if e == TransportError::Cancelled {
                    self.abort().await;
                }
                Err(e)
            }
        }
    }
}

#[async_trait]
impl TransportSession for FtpSession {
    async fn transfer(
        &mut self,
        job: &TransferJob,
        progress: &(dyn Fn(TransferProgress) + Send + Sync),
        cancel: &CancellationToken,
    ) -> Result<u64, TransportError> {
        if cancel.is_cancelled() {
            return Err(TransportError::Cancelled);
        }
        let restarted;
        let job = if job.offset > 0 && !self.features.rest_stream {
            tracing::warn!(
                "Task {}: server cannot resume, starting {} over",
                job.task_id,
                job.remote_path
            );
            restarted = TransferJob {
                offset: 0,
                ..job.clone()
            };
            &restarted
        } else {
            job
        };

        tracing::info!(
            "Task {}: {:?} {} at offset {}",
            job.task_id,
            job.direction,
            job.remote_path,
            job.offset
        );

        match job.direction {
            Direction::Upload => self.upload(job, progress, cancel).await,
            Direction::Download => self.download(job, progress, cancel).await,
        }
    }

    fn can_resume(&self) -> bool {
        self.features.rest_stream
    }

    async fn working_dir(&mut self) -> Result<String, TransportError> {
        let reply = self.control.expect("PWD", 2).await?;
        codec::parse_quoted_path(&reply)
    }

    async fn change_dir(&mut self, path: &str) -> Result<String, TransportError> {
        self.control.expect(&format!("CWD {}", path), 2).await?;
        self.working_dir().await
    }

    async fn list(&mut self, path: &str) -> Result<Vec<RemoteEntry>, TransportError> {
        let mut data = self.open_data().await?;
        self.start_command("LIST", path, 0).await?;

        let mut raw = Vec::new();
        timeout(self.config.data_timeout, data.read_to_end(&mut raw))
            .await
            .map_err(|_| TransportError::Transfer("timeout".to_string()))??;
        drop(data);
        self.finish_command().await?;

        Ok(listing::parse_listing(&String::from_utf8_lossy(&raw)))
    }

    async fn make_dir(&mut self, path: &str) -> Result<(), TransportError> {
        self.control.expect(&format!("MKD {}", path), 2).await?;
        Ok(())
    }

    async fn delete(&mut self, path: &str) -> Result<(), TransportError> {
        self.control.expect(&format!("DELE {}", path), 2).await?;
        Ok(())
    }

    async fn close(&mut self) {
        let _ = timeout(GOODBYE_TIMEOUT, self.control.execute("QUIT")).await;
    }
}

/// Failures before login completes are connection failures
fn connect_error(err: TransportError) -> TransportError {
    match err {
        TransportError::Transfer(message) => TransportError::Connect(message),
        other => other,
    }
}
