use serde::{Deserialize, Serialize};

/// Normalized deep-link input extracted from launch options, user activities
/// or scene connection options by the platform layer.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct LinkContext {
    pub url: Option<String>,
    pub scene_identifier: Option<String>,
    pub source_application: Option<String>,
}

impl LinkContext {
    pub fn url(url: impl Into<String>) -> Self {
        Self {
            url: Some(url.into()),
            ..Default::default()
        }
    }

    pub fn with_scene(mut self, scene_identifier: impl Into<String>) -> Self {
        self.scene_identifier = Some(scene_identifier.into());
        self
    }

    pub fn with_source(mut self, source_application: impl Into<String>) -> Self {
        self.source_application = Some(source_application.into());
        self
    }

    pub fn is_empty(&self) -> bool {
        self.url.is_none() && self.scene_identifier.is_none() && self.source_application.is_none()
    }
}

/// App lifecycle entry points that can start or join a session.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Trigger {
    ColdLaunch(Option<LinkContext>),
    OpenUrl(LinkContext),
    ContinueActivity(LinkContext),
    SceneConnect(Option<LinkContext>),
    PushNotification(Option<LinkContext>),
    Foreground,
}

impl Trigger {
    pub fn link(&self) -> Option<&LinkContext> {
        match self {
            Self::OpenUrl(link) | Self::ContinueActivity(link) => Some(link),
            Self::ColdLaunch(link) | Self::SceneConnect(link) | Self::PushNotification(link) => {
                link.as_ref()
            }
            Self::Foreground => None,
        }
    }

    /// An explicit deep link always re-attributes: it starts a fresh session
    /// unless one is already being established. Any trigger carrying a URL
    /// counts, including launch and scene-connection options.
    pub fn is_explicit_deep_link(&self) -> bool {
        match self {
            Self::OpenUrl(_) | Self::ContinueActivity(_) => true,
            Self::Foreground => false,
            _ => self.link().is_some_and(|l| l.url.is_some()),
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            Self::ColdLaunch(_) => "cold_launch",
            Self::OpenUrl(_) => "open_url",
            Self::ContinueActivity(_) => "continue_activity",
            Self::SceneConnect(_) => "scene_connect",
            Self::PushNotification(_) => "push_notification",
            Self::Foreground => "foreground",
        }
    }
}
