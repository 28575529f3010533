//! Typed parameters and result decoders for the known host commands.

use std::path::Path;

use base64::Engine;
use futures_util::future::try_join_all;
use hostbridge_protocol::HostCommand;
use hostbridge_protocol::chunking::DEFAULT_CHUNK_SIZE;
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};

use crate::bridge::HostBridge;
use crate::error::{BridgeError, BridgeResult};

/// Parameters for one known command.
pub trait HostRequest: Serialize {
    const COMMAND: HostCommand;

    fn validate(&self) -> BridgeResult<()> {
        Ok(())
    }

    fn to_params(&self) -> BridgeResult<Value> {
        self.validate()?;
        serde_json::to_value(self).map_err(|e| BridgeError::invalid(e.to_string()))
    }
}

fn require_node_id(node_id: &str) -> BridgeResult<()> {
    if node_id.trim().is_empty() {
        return Err(BridgeError::invalid("nodeId must not be empty"));
    }
    Ok(())
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ScanTextNodes {
    pub node_id: String,
    pub use_chunking: bool,
    pub chunk_size: usize,
}

impl ScanTextNodes {
    pub fn new(node_id: impl Into<String>) -> Self {
        Self {
            node_id: node_id.into(),
            use_chunking: true,
            chunk_size: DEFAULT_CHUNK_SIZE,
        }
    }

    pub fn chunk_size(mut self, chunk_size: usize) -> Self {
        self.chunk_size = chunk_size;
        self
    }

    pub fn without_chunking(mut self) -> Self {
        self.use_chunking = false;
        self
    }
}

impl HostRequest for ScanTextNodes {
    const COMMAND: HostCommand = HostCommand::ScanTextNodes;

    fn validate(&self) -> BridgeResult<()> {
        require_node_id(&self.node_id)?;
        if self.chunk_size == 0 {
            return Err(BridgeError::invalid("chunkSize must be at least 1"));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum ExportFormat {
    #[default]
    Png,
    Jpg,
    Svg,
    Pdf,
}

impl ExportFormat {
    pub fn mime_type(self) -> &'static str {
        match self {
            ExportFormat::Png => "image/png",
            ExportFormat::Jpg => "image/jpeg",
            ExportFormat::Svg => "image/svg+xml",
            ExportFormat::Pdf => "application/pdf",
        }
    }
}

impl std::str::FromStr for ExportFormat {
    type Err = BridgeError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_uppercase().as_str() {
            "PNG" => Ok(ExportFormat::Png),
            "JPG" | "JPEG" => Ok(ExportFormat::Jpg),
            "SVG" => Ok(ExportFormat::Svg),
            "PDF" => Ok(ExportFormat::Pdf),
            other => Err(BridgeError::invalid(format!("unknown export format {other}"))),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ExportImage {
    pub node_id: String,
    pub format: ExportFormat,
    pub scale: f64,
}

impl ExportImage {
    pub fn new(node_id: impl Into<String>) -> Self {
        Self {
            node_id: node_id.into(),
            format: ExportFormat::default(),
            scale: 1.0,
        }
    }

    pub fn format(mut self, format: ExportFormat) -> Self {
        self.format = format;
        self
    }

    pub fn scale(mut self, scale: f64) -> Self {
        self.scale = scale;
        self
    }
}

impl HostRequest for ExportImage {
    const COMMAND: HostCommand = HostCommand::ExportNodeAsImage;

    fn validate(&self) -> BridgeResult<()> {
        require_node_id(&self.node_id)?;
        if !self.scale.is_finite() || self.scale <= 0.0 {
            return Err(BridgeError::invalid("scale must be greater than 0"));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ScanNodesByTypes {
    pub node_id: String,
    pub types: Vec<String>,
}

impl HostRequest for ScanNodesByTypes {
    const COMMAND: HostCommand = HostCommand::ScanNodesByTypes;

    fn validate(&self) -> BridgeResult<()> {
        require_node_id(&self.node_id)?;
        if self.types.is_empty() {
            return Err(BridgeError::invalid("types must name at least one node type"));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct GetAnnotations {
    /// Scans the whole current page when unset.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub node_id: Option<String>,
    pub include_categories: bool,
}

impl Default for GetAnnotations {
    fn default() -> Self {
        Self {
            node_id: None,
            include_categories: true,
        }
    }
}

impl HostRequest for GetAnnotations {
    const COMMAND: HostCommand = HostCommand::GetAnnotations;
}

/// Node ids for `get_nodes_info`, resolved as one `get_node_info` per id.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NodeIds(pub Vec<String>);

impl NodeIds {
    pub fn validate(&self) -> BridgeResult<()> {
        if self.0.is_empty() {
            return Err(BridgeError::invalid("nodeIds must not be empty"));
        }
        self.0.iter().try_for_each(|id| require_node_id(id))
    }
}

/// Aggregated result of a text scan.
#[derive(Debug, Clone, PartialEq)]
pub struct ScanReport {
    pub total_nodes: u64,
    pub processed_nodes: u64,
    /// A non-chunked scan counts as one chunk.
    pub chunks: u64,
    pub text_nodes: Vec<Value>,
}

impl ScanReport {
    pub fn from_result(result: &Value) -> BridgeResult<Self> {
        let text_nodes = result
            .get("textNodes")
            .and_then(Value::as_array)
            .cloned()
            .ok_or_else(|| BridgeError::MalformedFrame("scan result without textNodes".into()))?;
        let field = |name: &str| result.get(name).and_then(Value::as_u64);
        let total_nodes = field("totalNodes")
            .or_else(|| field("count"))
            .unwrap_or(text_nodes.len() as u64);
        Ok(Self {
            total_nodes,
            processed_nodes: field("processedNodes").unwrap_or(total_nodes),
            chunks: field("chunks").unwrap_or(1),
            text_nodes,
        })
    }
}

fn default_mime_type() -> String {
    "image/png".to_string()
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExportedImage {
    /// Base64, without a `data:` prefix.
    pub image_data: String,
    #[serde(default = "default_mime_type")]
    pub mime_type: String,
}

impl ExportedImage {
    pub fn from_result(result: Value) -> BridgeResult<Self> {
        serde_json::from_value(result)
            .map_err(|e| BridgeError::MalformedFrame(format!("export result: {e}")))
    }

    pub fn decode(&self) -> BridgeResult<Vec<u8>> {
        base64::engine::general_purpose::STANDARD
            .decode(self.image_data.trim())
            .map_err(|e| BridgeError::MalformedFrame(format!("image data is not base64: {e}")))
    }

    /// Decode and write the image, returning the byte count.
    pub async fn write_to(&self, path: &Path) -> BridgeResult<usize> {
        let bytes = self.decode()?;
        tokio::fs::write(path, &bytes).await?;
        tracing::info!(path = %path.display(), bytes = bytes.len(), mime = %self.mime_type, "image written");
        Ok(bytes.len())
    }
}

impl HostBridge {
    /// Send a typed request and return the raw result.
    pub async fn request<R: HostRequest>(&self, request: &R) -> BridgeResult<Value> {
        let params = request.to_params()?;
        self.invoke(R::COMMAND, params).await
    }

    pub async fn get_document_info(&self) -> BridgeResult<Value> {
        self.invoke(HostCommand::GetDocumentInfo, json!({})).await
    }

    pub async fn get_selection(&self) -> BridgeResult<Value> {
        self.invoke(HostCommand::GetSelection, json!({})).await
    }

    pub async fn get_node_info(&self, node_id: &str) -> BridgeResult<Value> {
        require_node_id(node_id)?;
        self.invoke(HostCommand::GetNodeInfo, json!({ "nodeId": node_id }))
            .await
    }

    /// One `get_node_info` per id, issued concurrently; fails on the first
    /// error.
    pub async fn get_nodes_info(&self, ids: &NodeIds) -> BridgeResult<Vec<Value>> {
        ids.validate()?;
        try_join_all(ids.0.iter().map(|node_id| async move {
            let info = self.get_node_info(node_id).await?;
            Ok::<_, BridgeError>(json!({ "nodeId": node_id, "info": info }))
        }))
        .await
    }

    pub async fn scan_text_nodes(&self, request: &ScanTextNodes) -> BridgeResult<ScanReport> {
        let result = self.request(request).await?;
        ScanReport::from_result(&result)
    }

    pub async fn export_image(&self, request: &ExportImage) -> BridgeResult<ExportedImage> {
        let result = self.request(request).await?;
        ExportedImage::from_result(result)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn scan_params_use_wire_names() {
        let params = ScanTextNodes::new("1:2").chunk_size(5).to_params().unwrap();
        assert_eq!(
            params,
            json!({"nodeId": "1:2", "useChunking": true, "chunkSize": 5})
        );
        let params = ScanTextNodes::new("1:2").without_chunking().to_params().unwrap();
        assert_eq!(params["useChunking"], false);
        assert_eq!(params["chunkSize"], 10);
    }

    #[test]
    fn export_defaults_and_validation() {
        let params = ExportImage::new("3:4").to_params().unwrap();
        assert_eq!(params, json!({"nodeId": "3:4", "format": "PNG", "scale": 1.0}));

        for bad in [0.0, -1.0, f64::NAN] {
            assert!(matches!(
                ExportImage::new("3:4").scale(bad).to_params(),
                Err(BridgeError::InvalidParams(_))
            ));
        }
        assert_eq!("jpeg".parse::<ExportFormat>().unwrap(), ExportFormat::Jpg);
        assert!("gif".parse::<ExportFormat>().is_err());
    }

    #[test]
    fn scan_by_types_requires_types() {
        let request = ScanNodesByTypes {
            node_id: "1:1".into(),
            types: vec![],
        };
        assert!(request.to_params().is_err());
    }

    #[test]
    fn annotations_omit_missing_node() {
        let params = GetAnnotations::default().to_params().unwrap();
        assert_eq!(params, json!({"includeCategories": true}));
    }

    #[test]
    fn node_ids_must_be_non_empty() {
        assert!(NodeIds(vec![]).validate().is_err());
        assert!(NodeIds(vec!["1:1".into(), " ".into()]).validate().is_err());
        assert!(NodeIds(vec!["1:1".into()]).validate().is_ok());
    }

    #[test]
    fn scan_report_reads_chunked_and_plain_shapes() {
        let chunked = json!({
            "success": true,
            "totalNodes": 25,
            "processedNodes": 25,
            "chunks": 3,
            "textNodes": [{"id": "t1"}, {"id": "t2"}],
        });
        let report = ScanReport::from_result(&chunked).unwrap();
        assert_eq!((report.total_nodes, report.processed_nodes, report.chunks), (25, 25, 3));
        assert_eq!(report.text_nodes.len(), 2);

        let plain = json!({"success": true, "count": 2, "textNodes": [{}, {}]});
        let report = ScanReport::from_result(&plain).unwrap();
        assert_eq!((report.total_nodes, report.processed_nodes, report.chunks), (2, 2, 1));

        assert!(matches!(
            ScanReport::from_result(&json!({"chunks": 1})),
            Err(BridgeError::MalformedFrame(_))
        ));
    }

    #[tokio::test]
    async fn exported_image_writes_decoded_bytes() {
        let image = ExportedImage::from_result(json!({"imageData": "iVBORw0KGgo="})).unwrap();
        assert_eq!(image.mime_type, "image/png");

        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("out.png");
        let written = image.write_to(&path).await.unwrap();
        assert_eq!(written, 8);
        assert_eq!(std::fs::read(&path).unwrap(), b"\x89PNG\r\n\x1a\n");
    }

    #[test]
    fn bad_base64_is_malformed() {
        let image = ExportedImage {
            image_data: "***".into(),
            mime_type: default_mime_type(),
        };
        assert!(matches!(image.decode(), Err(BridgeError::MalformedFrame(_))));
    }
}
