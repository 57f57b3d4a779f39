//! Launching the user's browser for interactive sign-in

use std::io;

use url::Url;

/// Opens a URL for the user to interact with
pub trait BrowserLauncher: Send + Sync {
    /// Opens `url`, returning once the request to open it has been handed off
    fn open(&self, url: &Url) -> io::Result<()>;
}

/// Opens URLs in the operating system's default browser
#[derive(Clone, Copy, Debug, Default)]
pub struct SystemBrowser;

impl BrowserLauncher for SystemBrowser {
    fn open(&self, url: &Url) -> io::Result<()> {
        tracing::debug!(url = %url, "opening system browser");
        open::that(url.as_str())
    }
}
