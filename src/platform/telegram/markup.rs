//! Reduce general HTML to the small tag subset the bot API accepts.
//!
//! The input is tokenized, built into a tree and re-serialized. Supported
//! inline tags survive, headings become bold, block structure collapses to
//! line breaks, and everything else is unwrapped to its text. Code and
//! preformatted content is emitted as escaped text only.

/// Escape `&`, `<` and `>` so `text` is safe inside an HTML-mode message.
pub fn escape_text(text: &str) -> String {
    let mut escaped = String::with_capacity(text.len());
    for ch in text.chars() {
        match ch {
            '&' => escaped.push_str("&amp;"),
            '<' => escaped.push_str("&lt;"),
            '>' => escaped.push_str("&gt;"),
            _ => escaped.push(ch),
        }
    }
    escaped
}

/// Rewrite rich HTML into the bot platform's restricted markup.
pub fn sanitize_html(input: &str) -> String {
    let tree = build_tree(tokenize(input));
    let mut renderer = Renderer::default();
    renderer.render_nodes(&tree);
    renderer.out.trim().to_string()
}

// ── Tokens ─────────────────────────────────────────────────────────────────────

#[derive(Debug, PartialEq)]
enum Token<'a> {
    Text(&'a str),
    Open {
        name: String,
        attrs: Vec<(String, String)>,
        self_closing: bool,
    },
    Close(String),
    /// Comments, doctypes and processing instructions
    Ignored,
}

fn tokenize(input: &str) -> Vec<Token<'_>> {
    let mut tokens = Vec::new();
    let mut rest = input;

    while !rest.is_empty() {
        let Some(pos) = rest.find('<') else {
            tokens.push(Token::Text(rest));
            break;
        };
        if pos > 0 {
            tokens.push(Token::Text(&rest[..pos]));
            rest = &rest[pos..];
        }
        match scan_tag(rest) {
            Some((token, consumed)) => {
                tokens.push(token);
                rest = &rest[consumed..];
            }
            None => {
                // A '<' that does not open a tag is plain text.
                tokens.push(Token::Text(&rest[..1]));
                rest = &rest[1..];
            }
        }
    }

    tokens
}

/// Scan one tag at the start of `s` (which begins with '<').
/// Returns the token and the number of bytes it spans.
fn scan_tag(s: &str) -> Option<(Token<'_>, usize)> {
    if let Some(body) = s.strip_prefix("<!--") {
        let consumed = body.find("-->").map(|end| 4 + end + 3).unwrap_or(s.len());
        return Some((Token::Ignored, consumed));
    }
    if s.starts_with("<!") || s.starts_with("<?") {
        let end = s.find('>')?;
        return Some((Token::Ignored, end + 1));
    }
    if let Some(body) = s.strip_prefix("</") {
        let name_len = tag_name_len(body);
        if name_len == 0 {
            return None;
        }
        let end = body.find('>')?;
        let name = body[..name_len].to_ascii_lowercase();
        return Some((Token::Close(name), 2 + end + 1));
    }

    let body = &s[1..];
    let name_len = tag_name_len(body);
    if name_len == 0 || !body.starts_with(|c: char| c.is_ascii_alphabetic()) {
        return None;
    }
    let name = body[..name_len].to_ascii_lowercase();
    let (attrs, self_closing, attrs_len) = scan_attrs(&body[name_len..])?;
    Some((
        Token::Open {
            name,
            attrs,
            self_closing,
        },
        1 + name_len + attrs_len,
    ))
}

fn tag_name_len(s: &str) -> usize {
    s.find(|c: char| !(c.is_ascii_alphanumeric() || c == '-'))
        .unwrap_or(s.len())
}

/// Scan attributes up to and including the closing '>'.
fn scan_attrs(s: &str) -> Option<(Vec<(String, String)>, bool, usize)> {
    let mut attrs = Vec::new();
    let mut pos = 0;

    loop {
        let rest = &s[pos..];
        let trimmed = rest.trim_start();
        pos += rest.len() - trimmed.len();

        if trimmed.is_empty() {
            return None;
        }
        if trimmed.starts_with("/>") {
            return Some((attrs, true, pos + 2));
        }
        if trimmed.starts_with('>') {
            return Some((attrs, false, pos + 1));
        }
        if trimmed.starts_with('/') {
            pos += 1;
            continue;
        }

        let name_len = trimmed
            .find(|c: char| c.is_whitespace() || c == '=' || c == '>' || c == '/')
            .unwrap_or(trimmed.len());
        let name = trimmed[..name_len].to_ascii_lowercase();
        pos += name_len;

        let after_name = &s[pos..];
        let after_ws = after_name.trim_start();
        if let Some(value_part) = after_ws.strip_prefix('=') {
            pos += after_name.len() - after_ws.len() + 1;
            let raw = value_part.trim_start();
            pos += value_part.len() - raw.len();

            let value = match raw.chars().next() {
                Some(quote @ ('"' | '\'')) => {
                    let end = raw[1..].find(quote)?;
                    pos += end + 2;
                    &raw[1..1 + end]
                }
                _ => {
                    let end = raw
                        .find(|c: char| c.is_whitespace() || c == '>')
                        .unwrap_or(raw.len());
                    pos += end;
                    &raw[..end]
                }
            };
            attrs.push((name, decode_entities(value)));
        } else {
            attrs.push((name, String::new()));
        }
    }
}

fn decode_entities(text: &str) -> String {
    let mut decoded = String::with_capacity(text.len());
    let mut rest = text;

    while let Some(pos) = rest.find('&') {
        decoded.push_str(&rest[..pos]);
        rest = &rest[pos..];
        match rest.find(';').and_then(|end| decode_entity(&rest[1..end]).map(|ch| (ch, end))) {
            Some((ch, end)) => {
                decoded.push(ch);
                rest = &rest[end + 1..];
            }
            None => {
                decoded.push('&');
                rest = &rest[1..];
            }
        }
    }

    decoded.push_str(rest);
    decoded
}

fn decode_entity(name: &str) -> Option<char> {
    match name {
        "amp" => Some('&'),
        "lt" => Some('<'),
        "gt" => Some('>'),
        "quot" => Some('"'),
        "apos" => Some('\''),
        "nbsp" => Some('\u{a0}'),
        _ => {
            let number = name.strip_prefix('#')?;
            let code = match number.strip_prefix(['x', 'X']) {
                Some(hex) => u32::from_str_radix(hex, 16).ok()?,
                None => number.parse().ok()?,
            };
            char::from_u32(code)
        }
    }
}

// ── Tree ───────────────────────────────────────────────────────────────────────

#[derive(Debug)]
enum Node {
    Text(String),
    Element(Element),
}

#[derive(Debug)]
struct Element {
    name: String,
    attrs: Vec<(String, String)>,
    children: Vec<Node>,
}

impl Element {
    fn attr(&self, name: &str) -> Option<&str> {
        self.attrs
            .iter()
            .find(|(key, _)| key == name)
            .map(|(_, value)| value.as_str())
    }
}

const VOID_TAGS: &[&str] = &[
    "area", "base", "br", "col", "embed", "hr", "img", "input", "link", "meta", "source",
    "track", "wbr",
];

/// Deepest element nesting kept; tags opened below it are dropped and
/// their content is attached to the deepest open element.
const MAX_DEPTH: usize = 64;

#[derive(Default)]
struct TreeBuilder {
    root: Vec<Node>,
    open: Vec<Element>,
}

impl TreeBuilder {
    fn append(&mut self, node: Node) {
        match self.open.last_mut() {
            Some(parent) => parent.children.push(node),
            None => self.root.push(node),
        }
    }

    fn close_down_to(&mut self, depth: usize) {
        while self.open.len() > depth {
            if let Some(element) = self.open.pop() {
                self.append(Node::Element(element));
            }
        }
    }
}

fn build_tree(tokens: Vec<Token<'_>>) -> Vec<Node> {
    let mut builder = TreeBuilder::default();

    for token in tokens {
        match token {
            Token::Text(text) => builder.append(Node::Text(decode_entities(text))),
            Token::Open {
                name,
                attrs,
                self_closing,
            } => {
                let void = self_closing || VOID_TAGS.contains(&name.as_str());
                let element = Element {
                    name,
                    attrs,
                    children: Vec::new(),
                };
                if void {
                    builder.append(Node::Element(element));
                } else if builder.open.len() < MAX_DEPTH {
                    builder.open.push(element);
                }
            }
            Token::Close(name) => {
                // Unmatched closing tags are dropped.
                if let Some(depth) = builder.open.iter().rposition(|el| el.name == name) {
                    builder.close_down_to(depth);
                }
            }
            Token::Ignored => {}
        }
    }

    builder.close_down_to(0);
    builder.root
}

// ── Rendering ──────────────────────────────────────────────────────────────────

const INLINE_TAGS: &[&str] = &[
    "b", "strong", "i", "em", "u", "ins", "s", "strike", "del",
];

const BLOCK_TAGS: &[&str] = &[
    "p", "div", "ul", "ol", "li", "blockquote", "table", "thead", "tbody", "tfoot", "tr",
    "section", "article", "header", "footer", "aside", "nav", "dl", "dt", "dd", "figure",
    "figcaption", "details", "summary", "hr",
];

#[derive(Default)]
struct Renderer {
    out: String,
    /// A block boundary was crossed and has not been turned into a newline yet.
    pending_break: bool,
}

impl Renderer {
    fn render_nodes(&mut self, nodes: &[Node]) {
        for node in nodes {
            self.render_node(node);
        }
    }

    fn render_node(&mut self, node: &Node) {
        let element = match node {
            Node::Text(text) => {
                self.write(&escape_text(text));
                return;
            }
            Node::Element(element) => element,
        };

        let name = element.name.as_str();
        match name {
            "h1" | "h2" | "h3" => self.render_wrapped(element, &["b"]),
            "h4" | "h5" | "h6" => self.render_wrapped(element, &["i", "b"]),
            "pre" => {
                self.request_break();
                self.write("<pre>");
                for child in &element.children {
                    match child {
                        Node::Element(code) if code.name == "code" => {
                            self.write_code_open(code);
                            self.render_verbatim(&code.children);
                            self.out.push_str("</code>");
                        }
                        other => self.render_verbatim(std::slice::from_ref(other)),
                    }
                }
                self.out.push_str("</pre>");
                self.request_break();
            }
            "code" => {
                self.write("<code>");
                self.render_verbatim(&element.children);
                self.out.push_str("</code>");
            }
            "a" => match element.attr("href") {
                Some(href) => {
                    self.write(&format!("<a href=\"{}\">", escape_attr(href)));
                    self.render_nodes(&element.children);
                    self.out.push_str("</a>");
                }
                None => self.render_nodes(&element.children),
            },
            "br" => self.write("\n"),
            _ if INLINE_TAGS.contains(&name) => {
                self.write(&format!("<{}>", name));
                self.render_nodes(&element.children);
                self.out.push_str(&format!("</{}>", name));
            }
            _ if BLOCK_TAGS.contains(&name) => {
                self.request_break();
                self.render_nodes(&element.children);
                self.request_break();
            }
            _ => self.render_nodes(&element.children),
        }
    }

    /// Render a heading's content inside the given tags.
    fn render_wrapped(&mut self, element: &Element, tags: &[&str]) {
        self.request_break();
        for tag in tags {
            self.write(&format!("<{}>", tag));
        }
        self.render_nodes(&element.children);
        for tag in tags.iter().rev() {
            self.out.push_str(&format!("</{}>", tag));
        }
        self.request_break();
    }

    fn write_code_open(&mut self, code: &Element) {
        match code.attr("class") {
            Some(class) => self
                .out
                .push_str(&format!("<code class=\"{}\">", escape_attr(class))),
            None => self.out.push_str("<code>"),
        }
    }

    /// Emit only the escaped text of `nodes`, dropping any markup.
    fn render_verbatim(&mut self, nodes: &[Node]) {
        for node in nodes {
            match node {
                Node::Text(text) => self.out.push_str(&escape_text(text)),
                Node::Element(element) if element.name == "br" => self.out.push('\n'),
                Node::Element(element) => self.render_verbatim(&element.children),
            }
        }
    }

    fn request_break(&mut self) {
        self.pending_break = true;
    }

    fn write(&mut self, chunk: &str) {
        if self.pending_break {
            self.pending_break = false;
            if !self.out.is_empty() && !self.out.ends_with('\n') && !chunk.starts_with('\n') {
                self.out.push('\n');
            }
        }
        self.out.push_str(chunk);
    }
}

fn escape_attr(value: &str) -> String {
    escape_text(value).replace('"', "&quot;")
}
