use serde::Serialize;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NodeKind {
    Page,
    Frame,
    Text,
}

impl NodeKind {
    pub fn as_str(self) -> &'static str {
        match self {
            NodeKind::Page => "PAGE",
            NodeKind::Frame => "FRAME",
            NodeKind::Text => "TEXT",
        }
    }
}

/// A node in the synthetic document served by the mock host.
#[derive(Debug, Clone)]
pub struct DocumentNode {
    pub id: String,
    pub name: String,
    pub kind: NodeKind,
    pub visible: bool,
    /// Fails when its text is read, like a node whose font cannot load.
    pub corrupt: bool,
    pub characters: Option<String>,
    pub font_size: f64,
    pub children: Vec<DocumentNode>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TextNodeInfo {
    pub id: String,
    pub name: String,
    #[serde(rename = "type")]
    pub kind: &'static str,
    pub characters: String,
    pub font_size: f64,
}

impl DocumentNode {
    fn node(id: impl Into<String>, name: impl Into<String>, kind: NodeKind) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            kind,
            visible: true,
            corrupt: false,
            characters: None,
            font_size: 0.0,
            children: Vec::new(),
        }
    }

    pub fn page(id: impl Into<String>, name: impl Into<String>, children: Vec<DocumentNode>) -> Self {
        Self {
            children,
            ..Self::node(id, name, NodeKind::Page)
        }
    }

    pub fn frame(id: impl Into<String>, name: impl Into<String>, children: Vec<DocumentNode>) -> Self {
        Self {
            children,
            ..Self::node(id, name, NodeKind::Frame)
        }
    }

    pub fn text(id: impl Into<String>, characters: impl Into<String>) -> Self {
        let characters = characters.into();
        Self {
            characters: Some(characters.clone()),
            font_size: 14.0,
            ..Self::node(id, characters, NodeKind::Text)
        }
    }

    pub fn hidden(mut self) -> Self {
        self.visible = false;
        self
    }

    pub fn corrupt(mut self) -> Self {
        self.corrupt = true;
        self
    }

    pub fn find(&self, id: &str) -> Option<&DocumentNode> {
        if self.id == id {
            return Some(self);
        }
        self.children.iter().find_map(|child| child.find(id))
    }

    /// Pre-order walk that skips invisible subtrees, including `self`.
    pub fn visible_nodes(&self) -> Vec<&DocumentNode> {
        let mut out = Vec::new();
        self.walk_visible(&mut out);
        out
    }

    fn walk_visible<'a>(&'a self, out: &mut Vec<&'a DocumentNode>) {
        if !self.visible {
            return;
        }
        out.push(self);
        for child in &self.children {
            child.walk_visible(out);
        }
    }

    /// Text details for text nodes; `None` for anything else.
    pub fn text_info(&self) -> Result<Option<TextNodeInfo>, String> {
        if self.kind != NodeKind::Text {
            return Ok(None);
        }
        if self.corrupt {
            return Err(format!("cannot read text of node {}", self.id));
        }
        Ok(Some(TextNodeInfo {
            id: self.id.clone(),
            name: self.name.clone(),
            kind: self.kind.as_str(),
            characters: self.characters.clone().unwrap_or_default(),
            font_size: self.font_size,
        }))
    }

    pub fn count(&self) -> usize {
        1 + self.children.iter().map(DocumentNode::count).sum::<usize>()
    }
}

/// Page `0:1` holding frame `0:2` with `texts` visible text nodes, plus one
/// hidden text node (`2:0`) and one unreadable text node (`2:1`).
///
/// Scanning `0:1` visits `texts + 3` nodes and finds exactly `texts` text
/// nodes.
pub fn sample_page(texts: usize) -> DocumentNode {
    let labels = (0..texts)
        .map(|i| DocumentNode::text(format!("1:{i}"), format!("Label {i}")))
        .collect();
    DocumentNode::page(
        "0:1",
        "Page 1",
        vec![
            DocumentNode::frame("0:2", "Card", labels),
            DocumentNode::text("2:0", "Hidden").hidden(),
            DocumentNode::text("2:1", "Broken").corrupt(),
        ],
    )
}
