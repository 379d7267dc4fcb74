// src/resolver.rs
//
// Platform resolution.
//
// Per-platform resolvers live behind the `StreamResolver` trait: given a room
// and its credentials they answer "is it live, and where is the media".  This
// crate ships only the router, the proxy/timeout policy around it, and the
// resolver for raw `.m3u8`/`.flv` URLs; real platform resolvers are plugged
// in at startup.

use std::sync::Arc;
use std::time::Duration;

use futures::future::BoxFuture;
use tracing::debug;

use crate::config::{ConfigStore, Container, Quality, Settings};
use crate::error::ProbeError;
use crate::registry::Room;

/// Shared by probes, the FLV fetcher, and the muxer argv.
pub const USER_AGENT: &str = "Mozilla/5.0 (Windows NT 10.0; Win64; x64) \
     AppleWebKit/537.36 (KHTML, like Gecko) Chrome/124.0.0.0 Safari/537.36";

/// Probe deadlines mirror the muxer's rw-timeout classes.
pub const DOMESTIC_TIMEOUT: Duration = Duration::from_secs(15);
pub const OVERSEAS_TIMEOUT: Duration = Duration::from_secs(50);

// ─── Resolution ─────────────────────────────────────────────────────────────

/// A credential refreshed by a resolver mid-probe, to be written back to the
/// config file.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Credential {
    pub section: String,
    pub key: String,
    pub value: String,
}

/// Ephemeral result of one probe.
#[derive(Debug, Clone)]
pub struct Resolution {
    pub is_live: bool,
    /// Playable media URL; present iff `is_live`.
    pub media_url: Option<String>,
    pub anchor_name: String,
    pub title: Option<String>,
    /// Container the platform serves natively (FLV rooms bypass the muxer).
    pub preferred_container: Option<Container>,
    pub updated_credentials: Option<Credential>,
}

impl Resolution {
    pub fn offline(anchor_name: impl Into<String>) -> Self {
        Self {
            is_live: false,
            media_url: None,
            anchor_name: anchor_name.into(),
            title: None,
            preferred_container: None,
            updated_credentials: None,
        }
    }

    pub fn live(anchor_name: impl Into<String>, media_url: impl Into<String>) -> Self {
        Self {
            is_live: true,
            media_url: Some(media_url.into()),
            anchor_name: anchor_name.into(),
            title: None,
            preferred_container: None,
            updated_credentials: None,
        }
    }
}

// ─── The resolver seam ──────────────────────────────────────────────────────

/// Everything a platform resolver gets to work with.
pub struct ResolveContext<'a> {
    pub room: &'a Room,
    pub quality: Quality,
    /// Cookie string for this platform, when the user configured one.
    pub cookie: Option<String>,
    /// Bearer/API token for this platform, when configured.
    pub token: Option<String>,
    /// Proxy URL iff the proxy policy selected one for this host.
    pub proxy: Option<String>,
}

pub trait StreamResolver: Send + Sync {
    fn name(&self) -> &'static str;

    fn resolve<'a>(
        &'a self,
        cx: &'a ResolveContext<'a>,
    ) -> BoxFuture<'a, Result<Resolution, ProbeError>>;
}

type HostPredicate = Box<dyn Fn(&Room) -> bool + Send + Sync>;

// ─── Router ─────────────────────────────────────────────────────────────────

/// Dispatches a room to the first resolver whose predicate matches its host,
/// wrapping the call in the proxy policy and the per-region deadline.
pub struct ResolverRouter {
    routes: Vec<(HostPredicate, Arc<dyn StreamResolver>)>,
    settings: Arc<Settings>,
    store: Arc<ConfigStore>,
    domestic_timeout: Duration,
    overseas_timeout: Duration,
}

impl ResolverRouter {
    pub fn new(settings: Arc<Settings>, store: Arc<ConfigStore>) -> Self {
        let mut router = Self {
            routes: Vec::new(),
            settings,
            store,
            domestic_timeout: DOMESTIC_TIMEOUT,
            overseas_timeout: OVERSEAS_TIMEOUT,
        };
        // Raw media URLs are always resolvable.
        router.register(
            |room: &Room| room.platform_tag == crate::platform::CUSTOM_TAG,
            Arc::new(RawUrlResolver),
        );
        router
    }

    #[cfg(test)]
    pub fn with_timeouts(mut self, domestic: Duration, overseas: Duration) -> Self {
        self.domestic_timeout = domestic;
        self.overseas_timeout = overseas;
        self
    }

    pub fn register<P>(&mut self, predicate: P, resolver: Arc<dyn StreamResolver>)
    where
        P: Fn(&Room) -> bool + Send + Sync + 'static,
    {
        self.routes.push((Box::new(predicate), resolver));
    }

    /// Proxy URL for this room, per the allow-list policy.  A globally
    /// exported proxy environment also counts as detection.
    pub fn proxy_for(&self, room: &Room) -> Option<String> {
        if self.settings.proxy_applies(&room.platform_tag) {
            return self.settings.proxy_address.clone();
        }
        if self.settings.proxy_address.is_some() {
            for var in ["HTTPS_PROXY", "https_proxy", "HTTP_PROXY", "http_proxy"] {
                if std::env::var(var).map(|v| !v.is_empty()).unwrap_or(false) {
                    return self.settings.proxy_address.clone();
                }
            }
        }
        None
    }

    /// Run one probe for `room`.
    ///
    /// Refreshed credentials are persisted before the result is returned, so
    /// a retry after `AuthRequired` sees the new state.
    pub async fn resolve(&self, room: &Room) -> Result<Resolution, ProbeError> {
        let route = self
            .routes
            .iter()
            .find(|(predicate, _)| predicate(room))
            .ok_or_else(|| ProbeError::unknown_host(room.host()))?;

        let cx = ResolveContext {
            room,
            quality: room.quality,
            cookie: self
                .store
                .section_entries("Cookie")
                .remove(&room.platform_tag),
            token: self
                .store
                .section_entries("Authorization")
                .remove(&room.platform_tag),
            proxy: self.proxy_for(room),
        };

        let deadline = if room.overseas {
            self.overseas_timeout
        } else {
            self.domestic_timeout
        };

        let resolution = match tokio::time::timeout(deadline, route.1.resolve(&cx)).await {
            Ok(result) => result?,
            Err(_) => {
                return Err(ProbeError::network(format!(
                    "resolver '{}' timed out after {deadline:?}",
                    route.1.name()
                )))
            }
        };

        if let Some(cred) = &resolution.updated_credentials {
            debug!(section = %cred.section, key = %cred.key, "persisting refreshed credential");
            self.store.set(&cred.section, &cred.key, &cred.value).await;
        }
        Ok(resolution)
    }
}

// ─── Raw URL resolver ───────────────────────────────────────────────────────

/// Liveness for user-supplied `.m3u8`/`.flv` URLs is plain fetchability: the
/// CDN answers 2xx while the stream is up and 4xx once it is gone.
struct RawUrlResolver;

impl StreamResolver for RawUrlResolver {
    fn name(&self) -> &'static str {
        "raw-url"
    }

    fn resolve<'a>(
        &'a self,
        cx: &'a ResolveContext<'a>,
    ) -> BoxFuture<'a, Result<Resolution, ProbeError>> {
        Box::pin(async move {
            let mut builder = reqwest::Client::builder().user_agent(USER_AGENT);
            if let Some(proxy) = &cx.proxy {
                builder = builder.proxy(
                    reqwest::Proxy::all(proxy)
                        .map_err(|e| ProbeError::proxy_required(e.to_string()))?,
                );
            }
            let client = builder.build().map_err(ProbeError::from)?;

            let url = &cx.room.url;
            let mut request = client.get(url);
            if let Some(cookie) = &cx.cookie {
                request = request.header("Cookie", cookie);
            }
            if let Some(token) = &cx.token {
                request = request.header("Authorization", token);
            }
            let response = request.send().await.map_err(ProbeError::from)?;
            if !response.status().is_success() {
                return Ok(Resolution::offline(cx.room.host().to_string()));
            }

            let is_m3u8 = url.split(['?', '#']).next().unwrap_or(url).ends_with(".m3u8");
            if is_m3u8 {
                // A playlist that is not a playlist is a parse failure, not
                // an offline room.
                let body = response.text().await.map_err(ProbeError::from)?;
                if !body.contains("#EXTM3U") {
                    return Err(ProbeError::parse("response is not an m3u8 playlist"));
                }
            }

            let mut resolution = Resolution::live(cx.room.host().to_string(), url.clone());
            if !is_m3u8 {
                resolution.preferred_container = Some(Container::Flv);
            }
            Ok(resolution)
        })
    }
}

// ─── Tests ──────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ConfigStore;

    fn test_room(url: &str, tag: &str, overseas: bool) -> Room {
        Room {
            url: url.to_string(),
            quality: Quality::Original,
            alias: None,
            platform_tag: tag.to_string(),
            platform_display: tag.to_string(),
            overseas,
        }
    }

    struct FakeResolver {
        live: bool,
        credential: Option<Credential>,
    }

    impl StreamResolver for FakeResolver {
        fn name(&self) -> &'static str {
            "fake"
        }
        fn resolve<'a>(
            &'a self,
            cx: &'a ResolveContext<'a>,
        ) -> BoxFuture<'a, Result<Resolution, ProbeError>> {
            Box::pin(async move {
                if self.live {
                    let mut r = Resolution::live("Alice", "https://cdn/x.m3u8");
                    r.updated_credentials = self.credential.clone();
                    let _ = cx.quality;
                    Ok(r)
                } else {
                    Ok(Resolution::offline("Alice"))
                }
            })
        }
    }

    struct HangingResolver;

    impl StreamResolver for HangingResolver {
        fn name(&self) -> &'static str {
            "hanging"
        }
        fn resolve<'a>(
            &'a self,
            _cx: &'a ResolveContext<'a>,
        ) -> BoxFuture<'a, Result<Resolution, ProbeError>> {
            Box::pin(async move {
                futures::future::pending::<()>().await;
                unreachable!()
            })
        }
    }

    async fn router_in(dir: &std::path::Path, settings: Settings) -> ResolverRouter {
        let store = ConfigStore::open(dir.join("config.ini"), dir.join("URL_config.ini"))
            .await
            .unwrap();
        ResolverRouter::new(Arc::new(settings), store)
    }

    #[tokio::test]
    async fn unmatched_host_is_unknown() {
        let dir = tempfile::tempdir().unwrap();
        let router = router_in(dir.path(), Settings::default()).await;
        let room = test_room("https://live.douyin.com/1", "douyin", false);
        let err = router.resolve(&room).await.unwrap_err();
        assert_eq!(err.kind, crate::error::ErrorKind::UnknownHost);
    }

    #[tokio::test]
    async fn first_matching_route_wins() {
        let dir = tempfile::tempdir().unwrap();
        let mut router = router_in(dir.path(), Settings::default()).await;
        router.register(
            |room: &Room| room.platform_tag == "douyin",
            Arc::new(FakeResolver {
                live: true,
                credential: None,
            }),
        );
        let room = test_room("https://live.douyin.com/1", "douyin", false);
        let r = router.resolve(&room).await.unwrap();
        assert!(r.is_live);
        assert_eq!(r.anchor_name, "Alice");
    }

    #[tokio::test]
    async fn timeout_maps_to_network_failure() {
        let dir = tempfile::tempdir().unwrap();
        let mut router = router_in(dir.path(), Settings::default())
            .await
            .with_timeouts(Duration::from_millis(20), Duration::from_millis(20));
        router.register(|_: &Room| true, Arc::new(HangingResolver));
        let room = test_room("https://live.douyin.com/1", "douyin", false);
        let err = router.resolve(&room).await.unwrap_err();
        assert_eq!(err.kind, crate::error::ErrorKind::NetworkFailure);
        assert!(err.message.contains("timed out"));
    }

    #[tokio::test]
    async fn refreshed_credentials_are_persisted() {
        let dir = tempfile::tempdir().unwrap();
        let store = ConfigStore::open(
            dir.path().join("config.ini"),
            dir.path().join("URL_config.ini"),
        )
        .await
        .unwrap();
        let mut router = ResolverRouter::new(Arc::new(Settings::default()), store.clone());
        router.register(
            |room: &Room| room.platform_tag == "douyin",
            Arc::new(FakeResolver {
                live: true,
                credential: Some(Credential {
                    section: "Cookie".into(),
                    key: "douyin".into(),
                    value: "refreshed=1".into(),
                }),
            }),
        );
        let room = test_room("https://live.douyin.com/1", "douyin", false);
        router.resolve(&room).await.unwrap();
        assert_eq!(store.get("Cookie", "douyin", "").await, "refreshed=1");
    }

    #[tokio::test]
    async fn proxy_policy_selects_by_tag() {
        let dir = tempfile::tempdir().unwrap();
        let mut settings = Settings::default();
        settings.proxy_address = Some("http://127.0.0.1:7890".into());
        let router = router_in(dir.path(), settings).await;

        let overseas = test_room("https://www.tiktok.com/@a/live", "tiktok", true);
        assert_eq!(
            router.proxy_for(&overseas).as_deref(),
            Some("http://127.0.0.1:7890")
        );

        let domestic = test_room("https://live.douyin.com/1", "douyin", false);
        // douyin is not on the allow-list; only a global proxy env would
        // switch it on, and the test environment has none guaranteed, so we
        // only assert the allow-list path.
        if std::env::var("HTTPS_PROXY").is_err()
            && std::env::var("https_proxy").is_err()
            && std::env::var("HTTP_PROXY").is_err()
            && std::env::var("http_proxy").is_err()
        {
            assert_eq!(router.proxy_for(&domestic), None);
        }
    }
}
