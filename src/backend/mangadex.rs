use futures::stream::{self, StreamExt};
use serde::Deserialize;

use super::error::{FetchError, PrefetchError, Result};
use super::source::{ChapterRef, ContentSource, PageListBatch, PageListStream};
use super::source_behavior::RateHints;

const BASE_URL: &str = "https://api.mangadex.org";
const SOURCE_ID: &str = "mangadex";
const FEED_PAGE_SIZE: usize = 100;

#[derive(Debug, Clone)]
pub struct Chapter {
    pub id: String,
    pub chapter: String,
    pub title: String,
    pub volume: Option<String>,
    pub pages: usize,
}

impl Chapter {
    pub fn label(&self) -> String {
        match &self.volume {
            Some(volume) => format!("Vol.{} Ch.{} {}", volume, self.chapter, self.title),
            None => format!("Ch.{} {}", self.chapter, self.title),
        }
    }
}

impl From<&Chapter> for ChapterRef {
    fn from(chapter: &Chapter) -> Self {
        ChapterRef::new(chapter.id.clone(), chapter.label())
    }
}

#[derive(Debug, Deserialize)]
struct ChapterResponse {
    data: Vec<ChapterData>,
    total: usize,
}

#[derive(Debug, Deserialize)]
struct ChapterData {
    id: String,
    attributes: ChapterAttributes,
}

#[derive(Debug, Deserialize)]
struct ChapterAttributes {
    chapter: Option<String>,
    title: Option<String>,
    volume: Option<String>,
    pages: usize,
}

#[derive(Debug, Deserialize)]
struct AtHomeResponse {
    #[serde(rename = "baseUrl")]
    base_url: String,
    chapter: AtHomeChapter,
}

#[derive(Debug, Deserialize)]
struct AtHomeChapter {
    hash: String,
    #[serde(rename = "dataSaver")]
    data_saver: Vec<String>,
}

pub fn build_client() -> Result<reqwest::Client> {
    reqwest::Client::builder()
        .user_agent("Tachiyomi-TUI/0.1.0")
        .build()
        .map_err(|e| PrefetchError::Client(e.to_string()))
}

/// GET `url` and decode JSON, keeping the HTTP status on failure.
async fn get_json<T: serde::de::DeserializeOwned>(
    client: &reqwest::Client,
    url: &str,
) -> std::result::Result<T, FetchError> {
    let response = client.get(url).send().await?;
    let status = response.status();
    if !status.is_success() {
        return Err(FetchError::with_status(
            status.as_u16(),
            format!("GET {} returned {}", url, status),
        ));
    }
    Ok(response.json().await?)
}

#[derive(Clone)]
pub struct MangaDexSource {
    client: reqwest::Client,
}

impl MangaDexSource {
    pub fn new() -> Result<Self> {
        Ok(Self {
            client: build_client()?,
        })
    }

    /// Every English chapter of a manga, oldest first.
    pub async fn get_manga_chapters(&self, manga_id: &str) -> Result<Vec<Chapter>> {
        let mut chapters = Vec::new();
        let mut offset = 0;

        loop {
            let url = format!(
                "{}/manga/{}/feed?translatedLanguage[]=en&order[chapter]=asc&limit={}&offset={}",
                BASE_URL, manga_id, FEED_PAGE_SIZE, offset
            );
            let response: ChapterResponse = get_json(&self.client, &url).await?;
            let fetched = response.data.len();

            chapters.extend(
                response
                    .data
                    .into_iter()
                    .filter(|c| c.attributes.pages > 0)
                    .map(|c| Chapter {
                        id: c.id,
                        chapter: c.attributes.chapter.unwrap_or_else(|| "0".to_string()),
                        title: c.attributes.title.unwrap_or_else(|| "No Title".to_string()),
                        volume: c.attributes.volume,
                        pages: c.attributes.pages,
                    }),
            );

            offset += fetched;
            if fetched == 0 || offset >= response.total {
                break;
            }
        }

        log::debug!("{}: {} chapters", manga_id, chapters.len());
        Ok(chapters)
    }
}

async fn fetch_at_home_pages(client: reqwest::Client, chapter_id: String) -> PageListBatch {
    let url = format!("{}/at-home/server/{}", BASE_URL, chapter_id);

    match get_json::<AtHomeResponse>(&client, &url).await {
        Ok(response) => {
            let pages = response
                .chapter
                .data_saver
                .into_iter()
                .map(|filename| {
                    format!(
                        "{}/data-saver/{}/{}",
                        response.base_url, response.chapter.hash, filename
                    )
                })
                .collect();
            PageListBatch::complete(pages)
        }
        Err(e) => PageListBatch::failed(e),
    }
}

impl ContentSource for MangaDexSource {
    fn id(&self) -> &str {
        SOURCE_ID
    }

    fn rate_hints(&self) -> RateHints {
        // at-home/server is limited to 40 requests per minute
        RateHints {
            initial_rate: 0.5,
            max_rate: 0.66,
        }
    }

    /// The at-home endpoint returns the whole list at once, so the stream
    /// carries a single terminal batch.
    fn fetch_page_list(&self, chapter_id: &str) -> PageListStream {
        stream::once(fetch_at_home_pages(self.client.clone(), chapter_id.to_string())).boxed()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn chapter_feed_deserializes() {
        let body = r#"{
            "data": [
                {"id": "c1", "attributes": {"chapter": "1", "title": null, "volume": "1", "pages": 20, "translatedLanguage": "en"}},
                {"id": "c2", "attributes": {"chapter": null, "title": "Extra", "volume": null, "pages": 0, "translatedLanguage": "en"}}
            ],
            "total": 2
        }"#;
        let response: ChapterResponse = serde_json::from_str(body).unwrap();
        assert_eq!(response.total, 2);
        assert_eq!(response.data[0].attributes.pages, 20);
        assert!(response.data[1].attributes.chapter.is_none());
    }

    #[test]
    fn chapter_label_includes_volume_when_known() {
        let mut chapter = Chapter {
            id: "c1".to_string(),
            chapter: "12".to_string(),
            title: "Rain".to_string(),
            volume: Some("3".to_string()),
            pages: 18,
        };
        assert_eq!(ChapterRef::from(&chapter).label, "Vol.3 Ch.12 Rain");
        chapter.volume = None;
        assert_eq!(chapter.label(), "Ch.12 Rain");
    }
}
