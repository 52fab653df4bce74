// SuperVideo players
//
// The player setup is hidden in a p.a.c.k.e.r script
// (`eval(function(p,a,c,k,e,d){...}('payload',radix,count,'w0|w1|...'.split('|')...))`).
// Unpacking substitutes every base-`radix` word in the payload with its entry
// in the keyword table, after which the HLS `file:"...m3u8"` source is visible.

use anyhow::Result;
use async_trait::async_trait;
use lazy_static::lazy_static;
use regex::{Captures, Regex};
use tokio_util::sync::CancellationToken;
use url::Url;

use super::HostExtractor;
use crate::context::http::HttpClient;
use crate::providers::types::StreamCandidate;

const PACKER_MARKER: &str = "eval(function(p,a,c,k,e,d)";

lazy_static! {
    static ref PACKED_ARGS: Regex = Regex::new(
        r"(?s)\}\s*\(\s*'((?:[^'\\]|\\.)*)'\s*,\s*(\d+)\s*,\s*(\d+)\s*,\s*'((?:[^'\\]|\\.)*)'\s*\.split\(\s*'\|'\s*\)"
    )
    .unwrap();
    static ref WORD: Regex = Regex::new(r"\b\w+\b").unwrap();
    static ref HLS_FILE: Regex = Regex::new(r#"(?i)file:\s*"([^"]+\.m3u8[^"]*)""#).unwrap();
}

pub struct SuperVideo;

/// Packer word encoding: 0-9, a-z, A-Z
fn decode_word(word: &str, radix: u32) -> Option<usize> {
    word.chars().try_fold(0usize, |acc, ch| {
        let digit = match ch {
            '0'..='9' => ch as u32 - '0' as u32,
            'a'..='z' => ch as u32 - 'a' as u32 + 10,
            'A'..='Z' => ch as u32 - 'A' as u32 + 36,
            _ => return None,
        };
        if digit >= radix {
            return None;
        }
        acc.checked_mul(radix as usize)?.checked_add(digit as usize)
    })
}

/// Unpack the first packed script on the page
pub fn unpack(page: &str) -> Option<String> {
    let start = page.find(PACKER_MARKER)?;
    let captures = PACKED_ARGS.captures(&page[start..])?;

    let payload = captures[1].replace("\\'", "'").replace("\\\\", "\\");
    let radix: u32 = captures[2].parse().ok()?;
    if !(2..=62).contains(&radix) {
        return None;
    }
    let keywords: Vec<&str> = captures.get(4)?.as_str().split('|').collect();

    let unpacked = WORD.replace_all(&payload, |word: &Captures| {
        let token = &word[0];
        decode_word(token, radix)
            .and_then(|index| keywords.get(index))
            .filter(|keyword| !keyword.is_empty())
            .map(|keyword| keyword.to_string())
            .unwrap_or_else(|| token.to_string())
    });
    Some(unpacked.into_owned())
}

/// HLS source from a player page, packed or not
pub fn stream_url(page: &str) -> Option<String> {
    let find = |text: &str| HLS_FILE.captures(text).map(|c| c[1].to_string());
    unpack(page).as_deref().and_then(find).or_else(|| find(page))
}

#[async_trait]
impl HostExtractor for SuperVideo {
    fn name(&self) -> &'static str {
        "supervideo"
    }

    fn recognizes(&self, url: &Url, page: &str) -> bool {
        url.host_str().map_or(false, |h| h.contains("supervideo")) || page.contains(PACKER_MARKER)
    }

    async fn extract_page(
        &self,
        url: &Url,
        page: &str,
        _http: &HttpClient,
        _cancel: &CancellationToken,
    ) -> Result<Vec<StreamCandidate>> {
        Ok(stream_url(page)
            .map(|link| {
                vec![StreamCandidate::new("SuperVideo", link, "m3u8")
                    .with_header("Referer", format!("{}/", url.origin().ascii_serialization()))]
            })
            .unwrap_or_default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const PACKED: &str = r#"<script type='text/javascript'>eval(function(p,a,c,k,e,d){while(c--)if(k[c])p=p.replace(new RegExp('\\b'+c.toString(a)+'\\b','g'),k[c]);return p}('0("1").2({3:"4://5.6/7/8.m3u8?t=a"});',36,11,'jwplayer|vplayer|setup|file|https|cdn|example|hls|master||'.split('|'),0,{}))</script>"#;

    #[test]
    fn test_decode_word() {
        assert_eq!(decode_word("0", 36), Some(0));
        assert_eq!(decode_word("z", 36), Some(35));
        assert_eq!(decode_word("10", 36), Some(36));
        assert_eq!(decode_word("A", 62), Some(36));
        assert_eq!(decode_word("A", 36), None);
    }

    #[test]
    fn test_unpack_recovers_hls_url() {
        let unpacked = unpack(PACKED).unwrap();
        assert!(unpacked.starts_with(r#"jwplayer("vplayer").setup({file:"#));
        assert_eq!(
            stream_url(PACKED).as_deref(),
            Some("https://cdn.example/hls/master.m3u8?t=a")
        );
    }

    #[test]
    fn test_plain_page_and_missing_source() {
        assert_eq!(
            stream_url(r#"player.setup({file: "https://x.example/a.m3u8"})"#).as_deref(),
            Some("https://x.example/a.m3u8")
        );
        assert_eq!(stream_url("<html></html>"), None);
    }

    #[tokio::test]
    async fn test_extract_page_sets_referer() {
        let url = Url::parse("https://supervideo.example/e/abc").unwrap();
        let http = HttpClient::new(&crate::config::HttpConfig::default(), &Default::default()).unwrap();
        let candidates = SuperVideo
            .extract_page(&url, PACKED, &http, &CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(candidates.len(), 1);
        assert_eq!(candidates[0].kind, "m3u8");
        assert_eq!(
            candidates[0].headers.as_ref().unwrap()["Referer"],
            "https://supervideo.example/"
        );
    }
}
