//! `{placeholder}` command and topic templates.
//!
//! Templates are parsed once at load time; an unknown placeholder is a
//! configuration error, so rendering itself cannot fail.

use std::fmt;

use crate::error::{MeshError, MeshResult};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Placeholder {
    Name,
    Image,
    Container,
    Slot,
    Broker,
    Port,
    UserId,
    InputTopic,
    OutputTopic,
}

impl Placeholder {
    pub const ALL: [Placeholder; 9] = [
        Placeholder::Name,
        Placeholder::Image,
        Placeholder::Container,
        Placeholder::Slot,
        Placeholder::Broker,
        Placeholder::Port,
        Placeholder::UserId,
        Placeholder::InputTopic,
        Placeholder::OutputTopic,
    ];

    pub fn key(&self) -> &'static str {
        match self {
            Placeholder::Name => "name",
            Placeholder::Image => "image",
            Placeholder::Container => "container",
            Placeholder::Slot => "slot",
            Placeholder::Broker => "broker",
            Placeholder::Port => "port",
            Placeholder::UserId => "user_id",
            Placeholder::InputTopic => "input_topic",
            Placeholder::OutputTopic => "output_topic",
        }
    }

    fn from_key(key: &str) -> Option<Self> {
        Self::ALL.iter().copied().find(|p| p.key() == key)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum Segment {
    Literal(String),
    Var(Placeholder),
}

/// Values substituted into a template.
#[derive(Debug, Clone)]
pub struct TemplateContext<'a> {
    pub name: &'a str,
    pub image: &'a str,
    pub slot: usize,
    pub broker: &'a str,
    pub port: u16,
    pub user_id: u32,
    pub input_topic: &'a str,
    pub output_topic: &'a str,
}

impl TemplateContext<'_> {
    /// Per-session, per-slot container name: `<name>-u<user_id>-<slot>`.
    pub fn container(&self) -> String {
        format!("{}-u{}-{}", self.name, self.user_id, self.slot)
    }

    fn value(&self, placeholder: Placeholder) -> String {
        match placeholder {
            Placeholder::Name => self.name.to_string(),
            Placeholder::Image => self.image.to_string(),
            Placeholder::Container => self.container(),
            Placeholder::Slot => self.slot.to_string(),
            Placeholder::Broker => self.broker.to_string(),
            Placeholder::Port => self.port.to_string(),
            Placeholder::UserId => self.user_id.to_string(),
            Placeholder::InputTopic => self.input_topic.to_string(),
            Placeholder::OutputTopic => self.output_topic.to_string(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Template {
    source: String,
    segments: Vec<Segment>,
}

impl Template {
    /// Parse `source`, accepting only the `allowed` placeholders. `{{` and
    /// `}}` are literal braces.
    pub fn parse(source: &str, allowed: &[Placeholder]) -> MeshResult<Self> {
        let mut segments = Vec::new();
        let mut literal = String::new();
        let mut chars = source.chars().peekable();

        while let Some(c) = chars.next() {
            match c {
                '{' if chars.peek() == Some(&'{') => {
                    chars.next();
                    literal.push('{');
                }
                '}' if chars.peek() == Some(&'}') => {
                    chars.next();
                    literal.push('}');
                }
                '{' => {
                    let mut key = String::new();
                    let mut closed = false;
                    for k in chars.by_ref() {
                        if k == '}' {
                            closed = true;
                            break;
                        }
                        key.push(k);
                    }
                    if !closed {
                        return Err(MeshError::Configuration(format!(
                            "unterminated placeholder in '{}'",
                            source
                        )));
                    }
                    let placeholder = Placeholder::from_key(key.trim())
                        .filter(|p| allowed.contains(p))
                        .ok_or_else(|| {
                            MeshError::Configuration(format!(
                                "unknown placeholder '{{{}}}' in '{}'",
                                key, source
                            ))
                        })?;
                    if !literal.is_empty() {
                        segments.push(Segment::Literal(std::mem::take(&mut literal)));
                    }
                    segments.push(Segment::Var(placeholder));
                }
                _ => literal.push(c),
            }
        }
        if !literal.is_empty() {
            segments.push(Segment::Literal(literal));
        }

        Ok(Self {
            source: source.to_string(),
            segments,
        })
    }

    /// Parse a command template; every placeholder is allowed.
    pub fn command(source: &str) -> MeshResult<Self> {
        Self::parse(source, &Placeholder::ALL)
    }

    /// Parse a topic template; only `{user_id}` is allowed.
    pub fn topic(source: &str) -> MeshResult<Self> {
        Self::parse(source, &[Placeholder::UserId])
    }

    pub fn source(&self) -> &str {
        &self.source
    }

    /// Substitute values verbatim.
    pub fn render(&self, ctx: &TemplateContext<'_>) -> String {
        self.render_with(ctx, |v| v)
    }

    /// Substitute values, shell-quoting any that need it.
    pub fn render_shell(&self, ctx: &TemplateContext<'_>) -> String {
        self.render_with(ctx, shell_quote)
    }

    /// Render a topic template for one session.
    pub fn render_topic(&self, user_id: u32) -> String {
        let mut out = String::new();
        for segment in &self.segments {
            match segment {
                Segment::Literal(s) => out.push_str(s),
                Segment::Var(Placeholder::UserId) => out.push_str(&user_id.to_string()),
                Segment::Var(other) => {
                    out.push('{');
                    out.push_str(other.key());
                    out.push('}');
                }
            }
        }
        out
    }

    fn render_with(&self, ctx: &TemplateContext<'_>, escape: impl Fn(String) -> String) -> String {
        let mut out = String::new();
        for segment in &self.segments {
            match segment {
                Segment::Literal(s) => out.push_str(s),
                Segment::Var(p) => out.push_str(&escape(ctx.value(*p))),
            }
        }
        out
    }
}

impl fmt::Display for Template {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.source)
    }
}

fn shell_quote(value: String) -> String {
    let safe = !value.is_empty()
        && value
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || "-_./:@+=,%".contains(c));
    if safe {
        value
    } else {
        format!("'{}'", value.replace('\'', "'\\''"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ctx() -> TemplateContext<'static> {
        TemplateContext {
            name: "chatbot",
            image: "agentmesh/chat:latest",
            slot: 0,
            broker: "10.0.0.5",
            port: 1883,
            user_id: 3,
            input_topic: "3/chat/in",
            output_topic: "3/chat/out",
        }
    }

    #[test]
    fn test_render_all_placeholders() {
        let t = Template::command(
            "run {container} {image} --broker {broker}:{port} --user_id {user_id} {input_topic} {output_topic} #{slot} {{x}}",
        )
        .unwrap();
        assert_eq!(
            t.render(&ctx()),
            "run chatbot-u3-0 agentmesh/chat:latest --broker 10.0.0.5:1883 --user_id 3 3/chat/in 3/chat/out #0 {x}"
        );
    }

    #[test]
    fn test_unknown_or_unterminated_placeholder_rejected() {
        assert!(matches!(
            Template::command("docker run {imgae}"),
            Err(MeshError::Configuration(_))
        ));
        assert!(Template::command("docker run {image").is_err());
        assert!(Template::topic("{broker}/chat").is_err());
    }

    #[test]
    fn test_shell_render_quotes_unsafe_values() {
        let t = Template::command("agent --input_topic {input_topic}").unwrap();
        let mut c = ctx();
        c.input_topic = "it's here";
        assert_eq!(t.render_shell(&c), r#"agent --input_topic 'it'\''s here'"#);
    }

    #[test]
    fn test_topic_template_user_scope() {
        let t = Template::topic("{user_id}/pdf/encoded").unwrap();
        assert_eq!(t.render_topic(12), "12/pdf/encoded");
    }
}
