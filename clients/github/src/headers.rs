use std::str::FromStr;

use harvester::api::Quota;
use log::debug;
use reqwest::header::{HeaderMap, HeaderValue, LINK};
use url::Url;

pub(crate) const LIMIT: &str = "x-ratelimit-limit";
pub(crate) const REMAINING: &str = "x-ratelimit-remaining";
pub(crate) const RESET: &str = "x-ratelimit-reset";

/// Quota reported with a response, `None` unless all three rate limit headers parse.
pub(crate) fn read_quota(headers: &HeaderMap<HeaderValue>) -> Option<Quota> {
    let quota = Quota::new(
        read_header::<u32>(headers, LIMIT)?,
        read_header::<u32>(headers, REMAINING)?,
        read_header::<i64>(headers, RESET)?,
    );
    debug!("Response quota: {:?}", quota);
    Some(quota)
}

/// Page number of the `rel="last"` entry of a `Link` header.
pub(crate) fn read_last_page(headers: &HeaderMap<HeaderValue>) -> Option<u32> {
    let link = headers.get(LINK)?.to_str().ok()?;
    link.split(',').find_map(|entry| {
        let mut target = None;
        let mut last = false;
        for segment in entry.split(';').map(str::trim) {
            if let Some(url) = segment.strip_prefix('<').and_then(|segment| segment.strip_suffix('>')) {
                target = Some(url);
            } else if let Some(rel) = segment.strip_prefix("rel=") {
                last = rel.trim_matches('"') == "last";
            }
        }
        if !last {
            return None;
        }
        let url = Url::parse(target?).ok()?;
        url.query_pairs()
            .find(|(key, _)| key == "page")
            .and_then(|(_, page)| page.parse().ok())
    })
}

fn read_header<T: FromStr>(headers: &HeaderMap<HeaderValue>, header: &str) -> Option<T> {
    headers.get(header)?.to_str().ok()?.parse::<T>().ok()
}
