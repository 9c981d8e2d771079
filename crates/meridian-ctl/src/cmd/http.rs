//! Shared HTTP request helpers for CLI commands.

use anyhow::{Context, Result, bail};
use serde::{Deserialize, Serialize};

pub fn base_url(port: u16) -> String {
    format!("http://127.0.0.1:{}/api", port)
}

/// Turn a non-2xx response into an error carrying the daemon's message.
async fn parse<R: for<'de> Deserialize<'de>>(resp: reqwest::Response) -> Result<R> {
    let status = resp.status();
    if !status.is_success() {
        let body = resp.text().await.unwrap_or_default();
        bail!("daemon returned {}: {}", status, body);
    }
    resp.json::<R>().await.context("failed to parse response")
}

fn connect_error(url: &str) -> String {
    format!("failed to connect to meridiand at {} — is it running?", url)
}

pub async fn get_json<T: for<'de> Deserialize<'de>>(url: &str) -> Result<T> {
    let resp = reqwest::get(url).await.with_context(|| connect_error(url))?;
    parse(resp).await
}

pub async fn post_json<T: for<'de> Deserialize<'de>>(url: &str) -> Result<T> {
    let resp = reqwest::Client::new()
        .post(url)
        .send()
        .await
        .with_context(|| connect_error(url))?;
    parse(resp).await
}

pub async fn post_json_body<T, R>(url: &str, body: &T) -> Result<R>
where
    T: Serialize,
    R: for<'de> Deserialize<'de>,
{
    let resp = reqwest::Client::new()
        .post(url)
        .json(body)
        .send()
        .await
        .with_context(|| connect_error(url))?;
    parse(resp).await
}

pub async fn put_json_body<T, R>(url: &str, body: &T) -> Result<R>
where
    T: Serialize,
    R: for<'de> Deserialize<'de>,
{
    let resp = reqwest::Client::new()
        .put(url)
        .json(body)
        .send()
        .await
        .with_context(|| connect_error(url))?;
    parse(resp).await
}

pub async fn delete_json<R: for<'de> Deserialize<'de>>(url: &str) -> Result<R> {
    let resp = reqwest::Client::new()
        .delete(url)
        .send()
        .await
        .with_context(|| connect_error(url))?;
    parse(resp).await
}

/// Open a streaming GET (server-sent events).
pub async fn get_stream(url: &str) -> Result<reqwest::Response> {
    let resp = reqwest::get(url).await.with_context(|| connect_error(url))?;
    if !resp.status().is_success() {
        bail!("daemon returned {}", resp.status());
    }
    Ok(resp)
}

pub async fn post_multipart<R: for<'de> Deserialize<'de>>(
    url: &str,
    form: reqwest::multipart::Form,
) -> Result<R> {
    let resp = reqwest::Client::new()
        .post(url)
        .multipart(form)
        .send()
        .await
        .with_context(|| connect_error(url))?;
    parse(resp).await
}
