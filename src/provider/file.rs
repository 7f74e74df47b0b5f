//! File provider with hot reload.
//!
//! Reads a TOML dynamic configuration from one file or from every `.toml`
//! file of a directory, then re-reads it whenever `notify` reports a change.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use notify::{Event, RecommendedWatcher, RecursiveMode, Watcher};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::config::dynamic::Configuration;
use crate::config::loader::{load_dynamic, ConfigError};
use crate::config::schema::FileProviderConfig;
use crate::config::Message;
use crate::provider::{Provider, ProviderError};

pub const FILE_PROVIDER_NAME: &str = "file";

/// Provider backed by TOML files on disk.
#[derive(Debug, Clone)]
pub struct FileProvider {
    config: FileProviderConfig,
}

impl FileProvider {
    pub fn new(config: FileProviderConfig) -> Self {
        Self { config }
    }

    fn watched_path(&self) -> Option<&Path> {
        self.config
            .filename
            .as_deref()
            .or(self.config.directory.as_deref())
    }

    /// Read the configured file or directory into one configuration.
    pub fn build_configuration(&self) -> Result<Configuration, ConfigError> {
        if let Some(file) = &self.config.filename {
            return load_dynamic(file);
        }

        let mut conf = Configuration::default();
        let Some(dir) = &self.config.directory else {
            return Ok(conf);
        };

        let entries = std::fs::read_dir(dir).map_err(|source| ConfigError::Io {
            path: dir.clone(),
            source,
        })?;
        let mut files: Vec<PathBuf> = entries
            .filter_map(|entry| entry.ok().map(|e| e.path()))
            .filter(|path| path.extension().is_some_and(|ext| ext == "toml"))
            .collect();
        files.sort();

        for file in files {
            let fragment = load_dynamic(&file)?;
            merge_fragment(&mut conf, fragment, &file);
        }
        Ok(conf)
    }
}

impl Provider for FileProvider {
    fn name(&self) -> &str {
        FILE_PROVIDER_NAME
    }

    fn provide(
        &self,
        sender: mpsc::Sender<Message>,
        token: CancellationToken,
    ) -> Result<(), ProviderError> {
        let initial = self.build_configuration()?;

        let (event_tx, mut event_rx) = mpsc::unbounded_channel();
        let watcher = match (self.config.watch, self.watched_path()) {
            (true, Some(path)) => Some(watch(path, event_tx)?),
            _ => None,
        };

        let provider = self.clone();
        tokio::spawn(async move {
            // Dropping the watcher stops the notify thread.
            let _watcher = watcher;

            if sender
                .send(Message::new(FILE_PROVIDER_NAME, initial))
                .await
                .is_err()
            {
                return;
            }

            loop {
                tokio::select! {
                    _ = token.cancelled() => break,
                    event = event_rx.recv() => {
                        if event.is_none() {
                            break;
                        }
                        match provider.build_configuration() {
                            Ok(conf) => {
                                if sender.send(Message::new(FILE_PROVIDER_NAME, conf)).await.is_err() {
                                    break;
                                }
                            }
                            Err(e) => {
                                tracing::error!(
                                    error = %e,
                                    "Failed to reload configuration file. Keeping current configuration."
                                );
                            }
                        }
                    }
                }
            }

            tracing::debug!("File provider stopped");
        });

        Ok(())
    }
}

fn watch(
    path: &Path,
    events: mpsc::UnboundedSender<()>,
) -> Result<RecommendedWatcher, ProviderError> {
    let to_error = |source| ProviderError::Watch {
        path: path.display().to_string(),
        source,
    };

    let mut watcher = RecommendedWatcher::new(
        move |res: notify::Result<Event>| match res {
            Ok(event) => {
                if event.kind.is_modify() || event.kind.is_create() || event.kind.is_remove() {
                    tracing::info!("Configuration file change detected, reloading...");
                    let _ = events.send(());
                }
            }
            Err(e) => tracing::error!("Watch error: {:?}", e),
        },
        notify::Config::default(),
    )
    .map_err(to_error)?;

    watcher
        .watch(path, RecursiveMode::NonRecursive)
        .map_err(to_error)?;

    tracing::info!(path = ?path, "File provider watching");
    Ok(watcher)
}

fn merge_map<T>(dst: &mut BTreeMap<String, T>, src: BTreeMap<String, T>, kind: &str, file: &Path) {
    for (name, value) in src {
        if dst.contains_key(&name) {
            tracing::warn!(
                kind = kind,
                name = %name,
                file = ?file,
                "Duplicate definition across files, keeping the first"
            );
            continue;
        }
        dst.insert(name, value);
    }
}

fn merge_fragment(dst: &mut Configuration, src: Configuration, file: &Path) {
    if let Some(http) = src.http {
        let out = dst.http.get_or_insert_with(Default::default);
        merge_map(&mut out.routers, http.routers, "http router", file);
        merge_map(&mut out.middlewares, http.middlewares, "http middleware", file);
        merge_map(&mut out.services, http.services, "http service", file);
        merge_map(&mut out.models, http.models, "http model", file);
        merge_map(
            &mut out.servers_transports,
            http.servers_transports,
            "http servers transport",
            file,
        );
    }
    if let Some(tcp) = src.tcp {
        let out = dst.tcp.get_or_insert_with(Default::default);
        merge_map(&mut out.routers, tcp.routers, "tcp router", file);
        merge_map(&mut out.middlewares, tcp.middlewares, "tcp middleware", file);
        merge_map(&mut out.services, tcp.services, "tcp service", file);
        merge_map(&mut out.models, tcp.models, "tcp model", file);
        merge_map(
            &mut out.servers_transports,
            tcp.servers_transports,
            "tcp servers transport",
            file,
        );
    }
    if let Some(udp) = src.udp {
        let out = dst.udp.get_or_insert_with(Default::default);
        merge_map(&mut out.routers, udp.routers, "udp router", file);
        merge_map(&mut out.services, udp.services, "udp service", file);
    }
    if let Some(tls) = src.tls {
        let out = dst.tls.get_or_insert_with(Default::default);
        out.certificates.extend(tls.certificates);
        merge_map(&mut out.options, tls.options, "tls options", file);
        merge_map(&mut out.stores, tls.stores, "tls store", file);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    const ROUTER: &str = r#"
        [http.routers.api]
        service = "api"
        rule = "Host(`a`)"
    "#;

    #[test]
    fn directory_fragments_are_combined() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("a.toml"), ROUTER).unwrap();
        std::fs::write(
            dir.path().join("b.toml"),
            r#"
            [http.routers.api]
            service = "shadowed"
            [udp.services.dns.load_balancer]
            servers = [{ address = "127.0.0.1:5353" }]
            "#,
        )
        .unwrap();
        std::fs::write(dir.path().join("ignored.txt"), "not toml").unwrap();

        let provider = FileProvider::new(FileProviderConfig {
            filename: None,
            directory: Some(dir.path().to_path_buf()),
            watch: false,
        });
        let conf = provider.build_configuration().unwrap();
        assert_eq!(conf.http.unwrap().routers["api"].service, "api");
        assert!(conf.udp.unwrap().services.contains_key("dns"));
    }

    #[tokio::test]
    async fn pushes_initial_configuration() {
        let dir = tempfile::tempdir().unwrap();
        let file = dir.path().join("dynamic.toml");
        std::fs::write(&file, ROUTER).unwrap();

        let provider = FileProvider::new(FileProviderConfig {
            filename: Some(file),
            directory: None,
            watch: false,
        });
        let (tx, mut rx) = mpsc::channel(4);
        let token = CancellationToken::new();
        provider.provide(tx, token.clone()).unwrap();

        let msg = tokio::time::timeout(Duration::from_secs(1), rx.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(msg.provider_name, FILE_PROVIDER_NAME);
        assert!(!msg.is_empty());
        token.cancel();
    }

    #[test]
    fn invalid_file_fails_provide() {
        let dir = tempfile::tempdir().unwrap();
        let file = dir.path().join("broken.toml");
        std::fs::write(&file, "[http.routers.api\n").unwrap();

        let provider = FileProvider::new(FileProviderConfig {
            filename: Some(file),
            directory: None,
            watch: false,
        });
        let (tx, _rx) = mpsc::channel(1);
        let err = provider.provide(tx, CancellationToken::new()).unwrap_err();
        assert!(matches!(err, ProviderError::Config(ConfigError::Parse { .. })));
    }
}
