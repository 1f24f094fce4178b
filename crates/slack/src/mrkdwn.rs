//! Markdown to Slack mrkdwn conversion for outbound agent answers.

use pulldown_cmark::{Event, Options, Parser, Tag, TagEnd};

const BULLET: &str = "•";
const RULE: &str = "----------";

pub fn markdown_to_mrkdwn(markdown: &str) -> String {
    let mut renderer = Renderer::default();
    for event in Parser::new_ext(markdown, Options::ENABLE_STRIKETHROUGH | Options::ENABLE_TASKLISTS) {
        renderer.event(event);
    }
    renderer.finish()
}

#[derive(Default)]
struct Renderer {
    out: String,
    /// Next ordinal per open list; `None` for bullet lists.
    lists: Vec<Option<u64>>,
    /// Destinations of the links being rendered, innermost last.
    links: Vec<String>,
    quote_depth: usize,
    in_heading: bool,
    in_code_block: bool,
    blank_line_pending: bool,
}

impl Renderer {
    fn event(&mut self, event: Event<'_>) {
        match event {
            Event::Start(tag) => self.start(tag),
            Event::End(tag) => self.end(tag),
            Event::Text(text) if self.in_code_block => self.out.push_str(&text),
            Event::Text(text) => self.push_escaped(&text),
            Event::Code(code) => {
                self.out.push('`');
                self.out.push_str(&code);
                self.out.push('`');
            }
            Event::Html(html) | Event::InlineHtml(html) => self.push_escaped(&html),
            Event::SoftBreak | Event::HardBreak => self.new_line(),
            Event::Rule => {
                self.open_block();
                self.out.push_str(RULE);
                self.out.push('\n');
                self.blank_line_pending = self.lists.is_empty();
            }
            Event::TaskListMarker(done) => self.out.push_str(if done { "[x] " } else { "[ ] " }),
            Event::FootnoteReference(label) => self.push_escaped(&format!("[{label}]")),
            _ => {}
        }
    }

    fn start(&mut self, tag: Tag<'_>) {
        match tag {
            Tag::Paragraph => {
                if self.lists.is_empty() {
                    self.open_block();
                    self.quote_prefix();
                }
            }
            Tag::Heading { .. } => {
                self.open_block();
                self.in_heading = true;
                self.out.push('*');
            }
            Tag::BlockQuote(_) => {
                self.open_block();
                self.quote_depth += 1;
            }
            Tag::CodeBlock(_) => {
                self.open_block();
                self.in_code_block = true;
                self.out.push_str("```\n");
            }
            Tag::List(first) => {
                if self.lists.is_empty() {
                    self.open_block();
                } else {
                    self.line_break();
                }
                self.lists.push(first);
            }
            Tag::Item => {
                self.line_break();
                let depth = self.lists.len().saturating_sub(1);
                self.out.push_str(&"  ".repeat(depth));
                let marker = match self.lists.last_mut() {
                    Some(Some(ordinal)) => {
                        let marker = format!("{ordinal}. ");
                        *ordinal += 1;
                        marker
                    }
                    _ => format!("{BULLET} "),
                };
                self.out.push_str(&marker);
            }
            Tag::Emphasis => self.out.push('_'),
            Tag::Strong if !self.in_heading => self.out.push('*'),
            Tag::Strikethrough => self.out.push('~'),
            Tag::Link { dest_url, .. } | Tag::Image { dest_url, .. } => {
                self.out.push('<');
                self.push_escaped(&dest_url);
                self.out.push('|');
                self.links.push(dest_url.to_string());
            }
            _ => {}
        }
    }

    fn end(&mut self, tag: TagEnd) {
        match tag {
            TagEnd::Paragraph => {
                self.line_break();
                self.blank_line_pending = self.lists.is_empty();
            }
            TagEnd::Heading(_) => {
                self.in_heading = false;
                self.out.push_str("*\n");
            }
            TagEnd::BlockQuote(_) => {
                self.quote_depth = self.quote_depth.saturating_sub(1);
            }
            TagEnd::CodeBlock => {
                self.in_code_block = false;
                self.line_break();
                self.out.push_str("```\n");
                self.blank_line_pending = self.lists.is_empty();
            }
            TagEnd::List(_) => {
                self.lists.pop();
                self.line_break();
            }
            TagEnd::Item => self.line_break(),
            TagEnd::Emphasis => self.out.push('_'),
            TagEnd::Strong if !self.in_heading => self.out.push('*'),
            TagEnd::Strikethrough => self.out.push('~'),
            TagEnd::Link | TagEnd::Image => {
                // Empty labels fall back to the url.
                if let Some(url) = self.links.pop() {
                    if self.out.ends_with('|') {
                        self.push_escaped(&url);
                    }
                }
                self.out.push('>');
            }
            _ => {}
        }
    }

    /// Starts a top-level block, keeping one blank line after a paragraph.
    fn open_block(&mut self) {
        self.line_break();
        if self.blank_line_pending && !self.out.is_empty() {
            self.out.push('\n');
        }
        self.blank_line_pending = false;
    }

    fn line_break(&mut self) {
        if !self.out.is_empty() && !self.out.ends_with('\n') {
            self.out.push('\n');
        }
    }

    fn new_line(&mut self) {
        self.out.push('\n');
        self.quote_prefix();
    }

    fn quote_prefix(&mut self) {
        for _ in 0..self.quote_depth {
            self.out.push('>');
        }
        if self.quote_depth > 0 {
            self.out.push(' ');
        }
    }

    fn push_escaped(&mut self, text: &str) {
        for c in text.chars() {
            match c {
                '&' => self.out.push_str("&amp;"),
                '<' => self.out.push_str("&lt;"),
                '>' => self.out.push_str("&gt;"),
                other => self.out.push(other),
            }
        }
    }

    fn finish(self) -> String {
        self.out.trim_end_matches('\n').to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::markdown_to_mrkdwn;

    #[test]
    fn converts_emphasis_and_strike() {
        assert_eq!(markdown_to_mrkdwn("**bold** and *italic*"), "*bold* and _italic_");
        assert_eq!(markdown_to_mrkdwn("__bold__ ~~gone~~"), "*bold* ~gone~");
        assert_eq!(markdown_to_mrkdwn("**bold with *italic* inside**"), "*bold with _italic_ inside*");
    }

    #[test]
    fn converts_headings_bullets_and_links() {
        let markdown = "## Summary\n- see [the docs](https://docs.aws.amazon.com/s3/)\n  * nested";
        assert_eq!(
            markdown_to_mrkdwn(markdown),
            "*Summary*\n• see <https://docs.aws.amazon.com/s3/|the docs>\n  • nested"
        );
    }

    #[test]
    fn escapes_outside_code_only() {
        assert_eq!(markdown_to_mrkdwn("a < b && c > d"), "a &lt; b &amp;&amp; c &gt; d");
        assert_eq!(markdown_to_mrkdwn("run `a && b`"), "run `a && b`");
        assert_eq!(
            markdown_to_mrkdwn("```bash\naws s3 ls > out.txt\n```"),
            "```\naws s3 ls > out.txt\n```"
        );
    }

    #[test]
    fn leaves_snake_case_and_lone_markers_alone() {
        assert_eq!(markdown_to_mrkdwn("use call_aws_tool now"), "use call_aws_tool now");
        assert_eq!(markdown_to_mrkdwn("2 * 3 = 6"), "2 * 3 = 6");
    }

    #[test]
    fn resolves_reference_links_and_formatted_labels() {
        assert_eq!(
            markdown_to_mrkdwn("read [**S3** docs][s3]\n\n[s3]: https://docs.aws.amazon.com/s3/"),
            "read <https://docs.aws.amazon.com/s3/|*S3* docs>"
        );
        assert_eq!(
            markdown_to_mrkdwn("<https://aws.amazon.com>"),
            "<https://aws.amazon.com|https://aws.amazon.com>"
        );
    }

    #[test]
    fn keeps_paragraphs_ordered_lists_and_quotes() {
        assert_eq!(markdown_to_mrkdwn("first\n\nsecond"), "first\n\nsecond");
        assert_eq!(markdown_to_mrkdwn("3. three\n4. four"), "3. three\n4. four");
        assert_eq!(markdown_to_mrkdwn("> careful\n> now"), "> careful\n> now");
        assert_eq!(markdown_to_mrkdwn("# **Plan**"), "*Plan*");
    }
}
