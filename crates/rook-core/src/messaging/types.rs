use crate::domain::{ChannelId, InteractionId};

/// Where a response goes.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ReplyTarget {
    Channel(ChannelId),
    /// Structured interaction response (first response uses the callback, later ones follow up).
    Interaction { id: InteractionId, token: String },
}

/// A response payload: text, embed or both.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct Reply {
    pub content: Option<String>,
    pub embed: Option<Embed>,
    /// Only honoured for interaction targets.
    pub ephemeral: bool,
}

impl Reply {
    pub fn text(content: impl Into<String>) -> Self {
        Self {
            content: Some(content.into()),
            ..Self::default()
        }
    }

    pub fn embed(embed: Embed) -> Self {
        Self {
            embed: Some(embed),
            ..Self::default()
        }
    }

    pub fn ephemeral(mut self) -> Self {
        self.ephemeral = true;
        self
    }

    /// Best-effort plain text rendering (logs, tests, operator reports).
    pub fn plain_text(&self) -> String {
        let mut parts = Vec::new();
        if let Some(c) = &self.content {
            parts.push(c.clone());
        }
        if let Some(e) = &self.embed {
            if let Some(t) = &e.title {
                parts.push(t.clone());
            }
            if let Some(d) = &e.description {
                parts.push(d.clone());
            }
            for f in &e.fields {
                parts.push(format!("{}: {}", f.name, f.value));
            }
            if let Some(footer) = &e.footer {
                parts.push(footer.clone());
            }
        }
        parts.join("\n")
    }
}

#[derive(Clone, Debug, Default, PartialEq)]
pub struct Embed {
    pub title: Option<String>,
    pub description: Option<String>,
    pub fields: Vec<EmbedField>,
    pub footer: Option<String>,
    pub colour: Option<u32>,
}

#[derive(Clone, Debug, PartialEq)]
pub struct EmbedField {
    pub name: String,
    pub value: String,
    pub inline: bool,
}

impl Embed {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn title(mut self, title: impl Into<String>) -> Self {
        self.title = Some(title.into());
        self
    }

    pub fn description(mut self, description: impl Into<String>) -> Self {
        self.description = Some(description.into());
        self
    }

    pub fn field(mut self, name: impl Into<String>, value: impl Into<String>, inline: bool) -> Self {
        self.fields.push(EmbedField {
            name: name.into(),
            value: value.into(),
            inline,
        });
        self
    }

    pub fn footer(mut self, footer: impl Into<String>) -> Self {
        self.footer = Some(footer.into());
        self
    }

    pub fn colour(mut self, colour: u32) -> Self {
        self.colour = Some(colour);
        self
    }
}

impl From<String> for Reply {
    fn from(content: String) -> Self {
        Self::text(content)
    }
}

impl From<&str> for Reply {
    fn from(content: &str) -> Self {
        Self::text(content)
    }
}

impl From<Embed> for Reply {
    fn from(embed: Embed) -> Self {
        Self::embed(embed)
    }
}
