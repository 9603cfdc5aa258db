use std::sync::atomic::{AtomicU64, Ordering};

use anyhow::Result as AnyResult;
use async_trait::async_trait;
use reqwest::{
  header::{CONTENT_LENGTH, CONTENT_RANGE, RANGE},
  StatusCode,
};
use thiserror::Error;

use crate::{
  device::{check_range, copy_padded, BlockDevice},
  error::{BlockError, Result},
};

pub struct RangeResponse {
  pub body: Vec<u8>,
  /// Whether the server honoured the range. When false, `body` is the whole
  /// resource.
  pub partial: bool,
}

/// Byte-range access to a remote resource.
#[async_trait]
pub trait RangeFetcher: Send + Sync {
  async fn probe_size(&self) -> AnyResult<u64>;

  /// Fetches bytes `[start, end)`.
  async fn fetch_range(&self, start: u64, end: u64) -> AnyResult<RangeResponse>;
}

pub struct HttpRangeFetcher {
  client: reqwest::Client,
  url: String,
}

impl HttpRangeFetcher {
  pub fn new(url: impl Into<String>) -> Self {
    Self::with_client(reqwest::Client::new(), url)
  }

  pub fn with_client(client: reqwest::Client, url: impl Into<String>) -> Self {
    Self {
      client,
      url: url.into(),
    }
  }
}

#[async_trait]
impl RangeFetcher for HttpRangeFetcher {
  async fn probe_size(&self) -> AnyResult<u64> {
    #[derive(Error, Debug)]
    #[error("cannot determine size of {0}")]
    struct UnknownSize(String);

    let resp = self
      .client
      .head(&self.url)
      .send()
      .await?
      .error_for_status()?;
    if let Some(len) = header_u64(resp.headers().get(CONTENT_LENGTH)) {
      return Ok(len);
    }

    // Some servers omit Content-Length on HEAD; ask for one byte instead.
    let resp = self
      .client
      .get(&self.url)
      .header(RANGE, "bytes=0-0")
      .send()
      .await?
      .error_for_status()?;
    let size = match resp.status() {
      StatusCode::PARTIAL_CONTENT => resp
        .headers()
        .get(CONTENT_RANGE)
        .and_then(|x| x.to_str().ok())
        .and_then(parse_content_range_total),
      _ => header_u64(resp.headers().get(CONTENT_LENGTH)),
    };
    size.ok_or_else(|| UnknownSize(self.url.clone()).into())
  }

  async fn fetch_range(&self, start: u64, end: u64) -> AnyResult<RangeResponse> {
    #[derive(Error, Debug)]
    #[error("range response starts at {got:?}, requested {want}")]
    struct WrongRange {
      want: u64,
      got: Option<u64>,
    }

    let resp = self
      .client
      .get(&self.url)
      .header(RANGE, format!("bytes={}-{}", start, end - 1))
      .send()
      .await?
      .error_for_status()?;
    let partial = resp.status() == StatusCode::PARTIAL_CONTENT;
    if partial {
      let got = resp
        .headers()
        .get(CONTENT_RANGE)
        .and_then(|x| x.to_str().ok())
        .and_then(parse_content_range_start);
      if got != Some(start) {
        return Err(WrongRange { want: start, got }.into());
      }
    }
    let body = resp.bytes().await?.to_vec();
    Ok(RangeResponse { body, partial })
  }
}

fn header_u64(value: Option<&reqwest::header::HeaderValue>) -> Option<u64> {
  value?.to_str().ok()?.trim().parse().ok()
}

/// Parses the first byte position out of `bytes 100-199/12345`.
fn parse_content_range_start(value: &str) -> Option<u64> {
  let range = value.trim().strip_prefix("bytes")?.trim_start();
  let (first, _) = range.split_once('-')?;
  first.trim().parse().ok()
}

/// Parses the total length out of `bytes 0-0/12345`.
fn parse_content_range_total(value: &str) -> Option<u64> {
  let (_, total) = value.rsplit_once('/')?;
  total.trim().parse().ok()
}

/// Read-only base device backed by a range-fetchable remote resource.
///
/// The size is probed once at open and never changes afterwards.
pub struct RemoteSourceDevice {
  id: String,
  block_size: usize,
  size: u64,
  fetcher: Box<dyn RangeFetcher>,
  fallbacks: AtomicU64,
}

impl RemoteSourceDevice {
  pub async fn open(
    id: impl Into<String>,
    fetcher: impl RangeFetcher + 'static,
    block_size: usize,
  ) -> Result<Self> {
    assert!(block_size > 0, "block size must be non-zero");
    let id = id.into();
    let size = fetcher
      .probe_size()
      .await
      .map_err(|e| BlockError::io(&id, format!("size probe failed: {:#}", e)))?;
    log::info!("Opened remote device {} ({} bytes).", id, size);
    Ok(Self {
      id,
      block_size,
      size,
      fetcher: Box::new(fetcher),
      fallbacks: AtomicU64::new(0),
    })
  }

  pub async fn open_url(id: impl Into<String>, url: &str, block_size: usize) -> Result<Self> {
    Self::open(id, HttpRangeFetcher::new(url), block_size).await
  }

  /// Number of reads served by slicing a full-body response.
  pub fn fallback_count(&self) -> u64 {
    self.fallbacks.load(Ordering::Relaxed)
  }
}

#[async_trait]
impl BlockDevice for RemoteSourceDevice {
  fn id(&self) -> &str {
    &self.id
  }

  fn size(&self) -> u64 {
    self.size
  }

  fn block_size(&self) -> usize {
    self.block_size
  }

  fn readonly(&self) -> bool {
    true
  }

  async fn read_blocks(&self, index: u64, count: u64) -> Result<Vec<u8>> {
    check_range(&self.id, index, count, self.block_count())?;
    let mut out = vec![0u8; count as usize * self.block_size];
    if count == 0 {
      return Ok(out);
    }

    let start = index * self.block_size as u64;
    let end = ((index + count) * self.block_size as u64).min(self.size);
    let resp = self.fetcher.fetch_range(start, end).await.map_err(|e| {
      BlockError::io(
        &self.id,
        format!("fetch of blocks [{}, {}+{}) failed: {:#}", index, index, count, e),
      )
    })?;

    if resp.partial {
      if resp.body.len() as u64 != end - start {
        return Err(BlockError::io(
          &self.id,
          format!(
            "range response for blocks [{}, {}+{}) has {} bytes, expected {}",
            index,
            index,
            count,
            resp.body.len(),
            end - start
          ),
        ));
      }
      copy_padded(&resp.body, 0, &mut out);
    } else {
      if (resp.body.len() as u64) < end {
        return Err(BlockError::io(
          &self.id,
          format!(
            "full-body response has {} bytes, needed {}",
            resp.body.len(),
            end
          ),
        ));
      }
      if self.fallbacks.fetch_add(1, Ordering::Relaxed) == 0 {
        log::warn!(
          "Server for device {} ignored a range request and returned the full {} bytes; \
           every read will now transfer the whole image.",
          self.id,
          resp.body.len()
        );
      } else {
        log::debug!(
          "Device {}: sliced blocks [{}, {}+{}) from a full-body response.",
          self.id,
          index,
          index,
          count
        );
      }
      copy_padded(&resp.body, start, &mut out);
    }
    Ok(out)
  }

  async fn write_blocks(&self, index: u64, _data: &[u8]) -> Result<()> {
    Err(BlockError::ReadOnly {
      device: self.id.clone(),
      index,
    })
  }

  async fn sync(&self) -> Result<()> {
    Ok(())
  }

  async fn close(&self) -> Result<()> {
    Ok(())
  }
}
