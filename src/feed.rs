use url::Url;

/// One feed item's video. Immutable once built.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct MediaRef {
    pub id: String,
    pub url: String,
    pub poster_url: Option<String>,
}

impl MediaRef {
    pub fn new(id: impl Into<String>, url: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            url: sanitize_url(&url.into()),
            poster_url: None,
        }
    }

    pub fn with_poster(mut self, poster: impl Into<String>) -> Self {
        let poster = sanitize_url(&poster.into());
        self.poster_url = if poster.is_empty() {
            None
        } else {
            Some(poster)
        };
        self
    }

    pub fn has_url(&self) -> bool {
        !self.url.trim().is_empty()
    }

    /// Returns the reason this item cannot be played, if any.
    pub fn validate(&self) -> Result<(), String> {
        if !self.has_url() {
            return Err("video URL missing".to_string());
        }
        match Url::parse(&self.url) {
            Ok(parsed) if matches!(parsed.scheme(), "http" | "https" | "file") => Ok(()),
            Ok(parsed) => Err(format!("unsupported url scheme: {}", parsed.scheme())),
            Err(err) => Err(format!("invalid video url: {err}")),
        }
    }
}

fn sanitize_url(raw: &str) -> String {
    raw.trim().replace("&amp;", "&")
}

/// The ordered list of items the feed widget renders.
#[derive(Clone, Debug, Default)]
pub struct Feed {
    items: Vec<MediaRef>,
}

impl Feed {
    pub fn new(items: Vec<MediaRef>) -> Self {
        Self { items }
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    pub fn get(&self, index: usize) -> Option<&MediaRef> {
        self.items.get(index)
    }

    pub fn append_items(&mut self, items: impl IntoIterator<Item = MediaRef>) {
        self.items.extend(items);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sanitizes_encoded_urls() {
        let media = MediaRef::new("a", " https://cdn.test/v.mp4?token=a&amp;b=1 ");
        assert_eq!(media.url, "https://cdn.test/v.mp4?token=a&b=1");
        assert!(media.validate().is_ok());
    }

    #[test]
    fn missing_url_is_reported() {
        let media = MediaRef::new("a", "   ");
        assert_eq!(media.validate().unwrap_err(), "video URL missing");
    }

    #[test]
    fn rejects_unknown_scheme() {
        let media = MediaRef::new("a", "rtmp://live.test/stream");
        assert!(media.validate().unwrap_err().contains("rtmp"));
    }

    #[test]
    fn empty_poster_is_dropped() {
        let media = MediaRef::new("a", "https://cdn.test/v.mp4").with_poster("");
        assert!(media.poster_url.is_none());
    }

    #[test]
    fn feed_grows_in_order() {
        let mut feed = Feed::new(vec![MediaRef::new("a", "https://cdn.test/a.mp4")]);
        feed.append_items([MediaRef::new("b", "https://cdn.test/b.mp4")]);
        assert_eq!(feed.len(), 2);
        assert_eq!(feed.get(1).map(|m| m.id.as_str()), Some("b"));
        assert!(feed.get(2).is_none());
    }
}
