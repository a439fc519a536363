use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time;

use chrono::Utc;
use notify_common::envelope::Envelope;
use notify_common::notification::{NotificationChannel, NotificationItem};
use notify_common::repository::NotificationRepository;
use serde_json::json;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::ingest::IngestionError;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RemoteEntryKind {
    File,
    Directory,
    Symlink,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RemoteEntry {
    pub path: PathBuf,
    pub kind: RemoteEntryKind,
}

impl RemoteEntry {
    fn file_name(&self) -> String {
        self.path
            .file_name()
            .map(|name| name.to_string_lossy().into_owned())
            .unwrap_or_default()
    }
}

/// A connected remote file system. Every call blocks.
pub trait RemoteDirectory: Send + 'static {
    /// Entries of `dir`, without `.` and `..`.
    fn list(&mut self, dir: &Path) -> io::Result<Vec<RemoteEntry>>;

    fn read_to_string(&mut self, path: &Path) -> io::Result<String>;

    fn rename(&mut self, from: &Path, to: &Path) -> io::Result<()>;

    fn remove(&mut self, path: &Path) -> io::Result<()>;
}

/// Opens one connection per scan.
pub trait RemoteConnector: Send + Sync + 'static {
    type Directory: RemoteDirectory;

    fn connect(&self) -> Result<Self::Directory, IngestionError>;
}

/// Polls a directory on a remote server.
///
/// Regular files become New notifications on the `Sftp` channel and are then moved to the
/// remote archive directory. Directories and symbolic links are left alone.
pub struct SftpIngestion<C: RemoteConnector> {
    repository: Arc<dyn NotificationRepository>,
    connector: Arc<C>,
    input_dir: PathBuf,
    archive_dir: PathBuf,
    interval: time::Duration,
    max_retry: i32,
}

impl<C: RemoteConnector> SftpIngestion<C> {
    pub fn new(
        repository: Arc<dyn NotificationRepository>,
        connector: C,
        input_dir: impl Into<PathBuf>,
        archive_dir: impl Into<PathBuf>,
        interval: time::Duration,
        max_retry: i32,
    ) -> Self {
        Self {
            repository,
            connector: Arc::new(connector),
            input_dir: input_dir.into(),
            archive_dir: archive_dir.into(),
            interval,
            max_retry,
        }
    }

    pub async fn run(self, cancel: CancellationToken) {
        let mut interval = tokio::time::interval(self.interval);
        interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
        info!("polling remote {} for notifications", self.input_dir.display());

        loop {
            tokio::select! {
                biased;

                _ = cancel.cancelled() => break,
                _ = interval.tick() => {}
            }

            match self.scan_once(&cancel).await {
                Ok(0) => {}
                Ok(ingested) => debug!("ingested {} remote files", ingested),
                Err(error) => error!("sftp ingestion scan failed: {}", error),
            }
        }
        info!("sftp ingestion stopped");
    }

    /// Connect, ingest every regular file in the input directory and disconnect.
    /// Files that fail are logged and left in place for the next scan.
    pub async fn scan_once(&self, cancel: &CancellationToken) -> Result<usize, IngestionError> {
        let connector = self.connector.clone();
        let input_dir = self.input_dir.clone();
        let (mut remote, entries) = tokio::task::spawn_blocking(move || {
            let mut remote = connector.connect()?;
            let entries = remote
                .list(&input_dir)
                .map_err(|error| IngestionError::io(&input_dir, error))?;
            Ok::<_, IngestionError>((remote, entries))
        })
        .await??;

        let mut files: Vec<RemoteEntry> = entries
            .into_iter()
            .filter(|entry| entry.kind == RemoteEntryKind::File)
            .filter(|entry| !entry.file_name().starts_with('.'))
            .collect();
        files.sort_by(|a, b| a.path.cmp(&b.path));

        let mut ingested = 0;
        for entry in files {
            if cancel.is_cancelled() {
                break;
            }
            let (returned, result) = self.ingest_file(remote, &entry).await?;
            remote = returned;
            match result {
                Ok(()) => ingested += 1,
                Err(error) => warn!("skipping remote {}: {}", entry.path.display(), error),
            }
        }

        Ok(ingested)
    }

    /// The outer error means the connection is gone, the inner one only concerns this file.
    async fn ingest_file(
        &self,
        remote: C::Directory,
        entry: &RemoteEntry,
    ) -> Result<(C::Directory, Result<(), IngestionError>), IngestionError> {
        let path = entry.path.clone();
        let (remote, read) = blocking(remote, move |remote| remote.read_to_string(&path)).await?;
        let raw = match read {
            Ok(raw) => raw,
            Err(error) => return Ok((remote, Err(IngestionError::io(&entry.path, error)))),
        };
        let file_name = entry.file_name();

        let envelope = Envelope::wrap(
            &raw,
            json!({
                "source": "sftp",
                "fileName": file_name,
                "receivedAt": Utc::now(),
            }),
        );
        let item = NotificationItem::new(
            NotificationChannel::Sftp,
            envelope.to_string(),
            self.max_retry,
        );
        if let Err(error) = self.repository.insert(&item).await {
            return Ok((remote, Err(error.into())));
        }
        metrics::counter!("notify_ingested_total", "channel" => "sftp").increment(1);

        let from = entry.path.clone();
        let to = self.archive_dir.join(format!("{}_{}", item.id, file_name));
        let (remote, archived) = blocking(remote, move |remote| {
            remote.rename(&from, &to).or_else(|error| {
                // The notification is stored: a file left behind would be ingested again.
                error!("failed to archive remote {}, removing it: {}", from.display(), error);
                remote.remove(&from).map_err(|error| IngestionError::io(&from, error))
            })
        })
        .await?;

        if archived.is_ok() {
            info!(notification_id = %item.id, "ingested remote {}", file_name);
        }
        Ok((remote, archived))
    }
}

/// Run `f` on the blocking pool and hand the connection back.
async fn blocking<D, T>(
    mut remote: D,
    f: impl FnOnce(&mut D) -> T + Send + 'static,
) -> Result<(D, T), IngestionError>
where
    D: RemoteDirectory,
    T: Send + 'static,
{
    let result = tokio::task::spawn_blocking(move || {
        let out = f(&mut remote);
        (remote, out)
    })
    .await?;
    Ok(result)
}

#[cfg(feature = "sftp")]
pub use self::ssh::{SshConnector, SshCredentials, SshDirectory};

#[cfg(feature = "sftp")]
mod ssh {
    use std::io::{self, Read};
    use std::net::TcpStream;
    use std::path::{Path, PathBuf};

    use ssh2::{Session, Sftp};

    use super::{RemoteConnector, RemoteDirectory, RemoteEntry, RemoteEntryKind};
    use crate::ingest::IngestionError;

    #[derive(Debug, Clone)]
    pub struct SshCredentials {
        pub host: String,
        pub port: u16,
        pub username: String,
        pub password: Option<String>,
        pub private_key_path: Option<PathBuf>,
    }

    /// Connects with ssh2, preferring key authentication over a password.
    pub struct SshConnector {
        credentials: SshCredentials,
    }

    impl SshConnector {
        pub fn new(credentials: SshCredentials) -> Self {
            Self { credentials }
        }

        fn address(&self) -> String {
            format!("{}:{}", self.credentials.host, self.credentials.port)
        }

        fn open(&self) -> io::Result<Sftp> {
            let tcp = TcpStream::connect(self.address())?;
            let mut session = Session::new()?;
            session.set_tcp_stream(tcp);
            session.handshake()?;

            let credentials = &self.credentials;
            match (&credentials.private_key_path, &credentials.password) {
                (Some(key), _) => {
                    session.userauth_pubkey_file(&credentials.username, None, key, None)?
                }
                (None, Some(password)) => {
                    session.userauth_password(&credentials.username, password)?
                }
                (None, None) => {
                    return Err(io::Error::new(
                        io::ErrorKind::InvalidInput,
                        "no password or private key configured",
                    ))
                }
            }
            if !session.authenticated() {
                return Err(io::Error::new(
                    io::ErrorKind::PermissionDenied,
                    "ssh authentication failed",
                ));
            }

            Ok(session.sftp()?)
        }
    }

    impl RemoteConnector for SshConnector {
        type Directory = SshDirectory;

        fn connect(&self) -> Result<SshDirectory, IngestionError> {
            let sftp = self.open().map_err(|error| IngestionError::Connect {
                address: self.address(),
                error,
            })?;
            Ok(SshDirectory { sftp })
        }
    }

    pub struct SshDirectory {
        sftp: Sftp,
    }

    impl RemoteDirectory for SshDirectory {
        fn list(&mut self, dir: &Path) -> io::Result<Vec<RemoteEntry>> {
            let entries = self.sftp.readdir(dir)?;

            Ok(entries
                .into_iter()
                .map(|(path, stat)| {
                    let kind = if stat.file_type().is_symlink() {
                        RemoteEntryKind::Symlink
                    } else if stat.is_dir() {
                        RemoteEntryKind::Directory
                    } else {
                        RemoteEntryKind::File
                    };
                    RemoteEntry { path, kind }
                })
                .collect())
        }

        fn read_to_string(&mut self, path: &Path) -> io::Result<String> {
            let mut file = self.sftp.open(path)?;
            let mut raw = String::new();
            file.read_to_string(&mut raw)?;
            Ok(raw)
        }

        fn rename(&mut self, from: &Path, to: &Path) -> io::Result<()> {
            Ok(self.sftp.rename(from, to, None)?)
        }

        fn remove(&mut self, path: &Path) -> io::Result<()> {
            Ok(self.sftp.unlink(path)?)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use notify_common::notification::NotificationState;
    use notify_common::repository::MemoryNotificationRepository;
    use serde_json::Value;
    use std::collections::BTreeMap;
    use std::sync::Mutex;

    /// A remote directory tree held in memory. `None` content marks an unreadable file.
    #[derive(Default)]
    struct MemoryServer {
        entries: BTreeMap<PathBuf, (RemoteEntryKind, Option<String>)>,
        connections: usize,
    }

    #[derive(Clone, Default)]
    struct MemoryConnector(Arc<Mutex<MemoryServer>>);

    impl MemoryConnector {
        fn add(&self, path: &str, kind: RemoteEntryKind, content: Option<&str>) {
            self.0
                .lock()
                .unwrap()
                .entries
                .insert(PathBuf::from(path), (kind, content.map(str::to_owned)));
        }

        fn paths(&self) -> Vec<PathBuf> {
            self.0.lock().unwrap().entries.keys().cloned().collect()
        }
    }

    impl RemoteConnector for MemoryConnector {
        type Directory = MemoryConnector;

        fn connect(&self) -> Result<MemoryConnector, IngestionError> {
            self.0.lock().unwrap().connections += 1;
            Ok(self.clone())
        }
    }

    impl RemoteDirectory for MemoryConnector {
        fn list(&mut self, dir: &Path) -> io::Result<Vec<RemoteEntry>> {
            Ok(self
                .0
                .lock()
                .unwrap()
                .entries
                .iter()
                .filter(|(path, _)| path.parent() == Some(dir))
                .map(|(path, (kind, _))| RemoteEntry {
                    path: path.clone(),
                    kind: *kind,
                })
                .collect())
        }

        fn read_to_string(&mut self, path: &Path) -> io::Result<String> {
            match self.0.lock().unwrap().entries.get(path) {
                Some((_, Some(content))) => Ok(content.clone()),
                Some((_, None)) => Err(io::Error::new(io::ErrorKind::PermissionDenied, "denied")),
                None => Err(io::ErrorKind::NotFound.into()),
            }
        }

        fn rename(&mut self, from: &Path, to: &Path) -> io::Result<()> {
            let mut server = self.0.lock().unwrap();
            let entry = server
                .entries
                .remove(from)
                .ok_or(io::Error::from(io::ErrorKind::NotFound))?;
            server.entries.insert(to.to_path_buf(), entry);
            Ok(())
        }

        fn remove(&mut self, path: &Path) -> io::Result<()> {
            self.0.lock().unwrap().entries.remove(path);
            Ok(())
        }
    }

    fn ingestion(
        repository: Arc<MemoryNotificationRepository>,
        connector: MemoryConnector,
    ) -> SftpIngestion<MemoryConnector> {
        SftpIngestion::new(
            repository,
            connector,
            "/outbox",
            "/archive",
            time::Duration::from_millis(10),
            3,
        )
    }

    #[tokio::test]
    async fn test_scan_ingests_regular_files_and_archives_them() {
        let repository = Arc::new(MemoryNotificationRepository::default());
        let server = MemoryConnector::default();
        server.add("/outbox/a.json", RemoteEntryKind::File, Some(r#"{"name":"Ada"}"#));
        server.add("/outbox/nested", RemoteEntryKind::Directory, None);
        server.add("/outbox/link.json", RemoteEntryKind::Symlink, Some("{}"));
        server.add("/elsewhere/b.json", RemoteEntryKind::File, Some("{}"));
        let ingestion = ingestion(repository.clone(), server.clone());

        let ingested = ingestion.scan_once(&CancellationToken::new()).await.unwrap();

        assert_eq!(ingested, 1);
        let items = repository.all();
        assert_eq!(items.len(), 1);
        assert_eq!(items[0].channel, NotificationChannel::Sftp);
        assert_eq!(items[0].state, NotificationState::New);
        assert_eq!(items[0].max_retry, 3);

        let envelope: Value = serde_json::from_str(&items[0].payload).unwrap();
        assert_eq!(envelope["source"], "sftp");
        assert_eq!(envelope["fileName"], "a.json");
        assert_eq!(envelope["raw"], r#"{"name":"Ada"}"#);
        assert!(envelope["receivedAt"].is_string());

        let paths = server.paths();
        assert!(!paths.contains(&PathBuf::from("/outbox/a.json")));
        assert!(paths.contains(&PathBuf::from(format!("/archive/{}_a.json", items[0].id))));
        assert!(paths.contains(&PathBuf::from("/outbox/nested")));
        assert!(paths.contains(&PathBuf::from("/outbox/link.json")));
        assert!(paths.contains(&PathBuf::from("/elsewhere/b.json")));
    }

    #[tokio::test]
    async fn test_unreadable_remote_file_is_skipped() {
        let repository = Arc::new(MemoryNotificationRepository::default());
        let server = MemoryConnector::default();
        server.add("/outbox/a.json", RemoteEntryKind::File, None);
        server.add("/outbox/b.json", RemoteEntryKind::File, Some("{}"));
        let ingestion = ingestion(repository.clone(), server.clone());

        let ingested = ingestion.scan_once(&CancellationToken::new()).await.unwrap();

        assert_eq!(ingested, 1);
        assert_eq!(repository.all().len(), 1);
        assert!(server.paths().contains(&PathBuf::from("/outbox/a.json")));
        assert!(!server.paths().contains(&PathBuf::from("/outbox/b.json")));
    }

    #[tokio::test]
    async fn test_each_scan_opens_a_connection() {
        let repository = Arc::new(MemoryNotificationRepository::default());
        let server = MemoryConnector::default();
        server.add("/outbox/a.json", RemoteEntryKind::File, Some("{}"));
        let ingestion = ingestion(repository.clone(), server.clone());
        let cancel = CancellationToken::new();

        assert_eq!(ingestion.scan_once(&cancel).await.unwrap(), 1);
        assert_eq!(ingestion.scan_once(&cancel).await.unwrap(), 0);

        assert_eq!(server.0.lock().unwrap().connections, 2);
        assert_eq!(repository.all().len(), 1);
    }
}
