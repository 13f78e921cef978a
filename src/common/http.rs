use std::time::Duration;

use reqwest::Client;

const DEFAULT_USER_AGENT: &str = concat!("nodelink/", env!("CARGO_PKG_VERSION"));

pub struct HttpClient;

impl HttpClient {
    pub fn default_user_agent() -> &'static str {
        DEFAULT_USER_AGENT
    }

    pub fn new() -> Result<Client, reqwest::Error> {
        Client::builder()
            .user_agent(Self::default_user_agent())
            .timeout(Duration::from_secs(10))
            .build()
    }
}
