//! Stable device identity stored on the device itself
//!
//! Each device carries a marker file holding an opaque id. A connection to a
//! device without one gets a freshly generated id written back, so the next
//! connection to that device resolves to the same id.

use std::sync::Arc;

use chrono::Local;

use herd_bridge::Connection;
use herd_core::prelude::*;

/// Default marker location, readable and writable without root
pub const DEFAULT_MARKER_PATH: &str = "/sdcard/droidherd-id";

/// Reads and provisions device identity markers
#[derive(Debug, Clone)]
pub struct IdentityResolver {
    marker_path: String,
}

impl Default for IdentityResolver {
    fn default() -> Self {
        Self::new(DEFAULT_MARKER_PATH)
    }
}

impl IdentityResolver {
    pub fn new(marker_path: impl Into<String>) -> Self {
        Self {
            marker_path: marker_path.into(),
        }
    }

    pub fn marker_path(&self) -> &str {
        &self.marker_path
    }

    /// Return the device's stable id, provisioning one if the marker is absent
    pub async fn resolve(&self, connection: &Arc<dyn Connection>) -> Result<String> {
        if let Some(existing) = self.read(connection).await? {
            trace!("{} identifies as {}", connection.connection_id(), existing);
            return Ok(existing);
        }

        let id = generate_id(connection.connection_id());
        info!(
            "Provisioning {} with new identity {}",
            connection.connection_id(),
            id
        );
        self.write(connection, &id).await?;
        Ok(id)
    }

    async fn read(&self, connection: &Arc<dyn Connection>) -> Result<Option<String>> {
        let command = format!("cat {}", quote(&self.marker_path));
        let content = match connection.execute_shell_command(&command).complete().await {
            Ok(content) => content,
            Err(Error::NotFound { .. }) => return Ok(None),
            Err(e) => return Err(e),
        };
        parse_marker(&content)
    }

    async fn write(&self, connection: &Arc<dyn Connection>, id: &str) -> Result<()> {
        let command = format!("echo {} > {}", quote(id), quote(&self.marker_path));
        connection
            .execute_shell_command(&command)
            .complete()
            .await
            .map(|_| ())
    }
}

/// Interpret marker file content. Empty means "not provisioned".
pub fn parse_marker(content: &str) -> Result<Option<String>> {
    let trimmed = content.trim();
    if trimmed.is_empty() {
        return Ok(None);
    }
    if trimmed.lines().count() > 1 {
        return Err(Error::identity(format!(
            "identity marker holds {} lines, expected one",
            trimmed.lines().count()
        )));
    }
    Ok(Some(trimmed.to_string()))
}

/// A new globally unique id; the readable prefix is informational only
pub fn generate_id(connection_id: &str) -> String {
    format!(
        "droidherd: first seen {} as {}. {:032x}",
        Local::now().format("%Y-%m-%d %H:%M:%S"),
        connection_id,
        rand::random::<u128>()
    )
}

fn quote(word: &str) -> String {
    shell_escape::unix::escape(word.into()).into_owned()
}

#[cfg(test)]
mod tests {
    use super::*;
    use herd_bridge::test_utils::FakeDevice;
    use herd_core::ScannerId;

    #[test]
    fn test_parse_marker() {
        assert_eq!(parse_marker("").unwrap(), None);
        assert_eq!(parse_marker("  \n").unwrap(), None);
        assert_eq!(parse_marker("abc\n").unwrap().as_deref(), Some("abc"));
        assert!(matches!(
            parse_marker("one\ntwo\n"),
            Err(Error::Identity { .. })
        ));
    }

    #[test]
    fn test_generated_ids_are_unique() {
        let a = generate_id("emulator-5554");
        let b = generate_id("emulator-5554");
        assert_ne!(a, b);
        assert!(a.contains("emulator-5554"));
        assert!(!a.contains('\n'));
    }

    #[tokio::test]
    async fn test_existing_marker_is_returned() {
        let phone = FakeDevice::new().with_file(DEFAULT_MARKER_PATH, "phone-7\n");
        let connection: Arc<dyn Connection> = phone.connect("c1", ScannerId(0));

        let id = IdentityResolver::default().resolve(&connection).await.unwrap();
        assert_eq!(id, "phone-7");
    }

    #[tokio::test]
    async fn test_missing_marker_is_provisioned_once() {
        let phone = FakeDevice::new();
        let resolver = IdentityResolver::default();

        let first: Arc<dyn Connection> = phone.connect("c1", ScannerId(0));
        let id = resolver.resolve(&first).await.unwrap();
        assert_eq!(phone.file_text(DEFAULT_MARKER_PATH).unwrap().trim(), id);

        let second: Arc<dyn Connection> = phone.connect("c2", ScannerId(0));
        assert_eq!(resolver.resolve(&second).await.unwrap(), id);
    }

    #[tokio::test]
    async fn test_empty_marker_is_reprovisioned() {
        let phone = FakeDevice::new().with_file("/data/id", "");
        let connection: Arc<dyn Connection> = phone.connect("c1", ScannerId(0));

        let id = IdentityResolver::new("/data/id").resolve(&connection).await.unwrap();
        assert!(id.starts_with("droidherd: first seen"));
        assert_eq!(phone.file_text("/data/id").unwrap(), format!("{}\n", id));
    }

    #[tokio::test]
    async fn test_transport_failure_is_propagated() {
        let phone = FakeDevice::new();
        let connection = phone.connect("c1", ScannerId(0));
        connection.sever();
        let connection: Arc<dyn Connection> = connection;

        let err = IdentityResolver::default().resolve(&connection).await.unwrap_err();
        assert!(err.is_connection_error());
        assert!(phone.file_paths().is_empty());
    }
}
