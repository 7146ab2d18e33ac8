use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::{error::AppError, types::Invoice};

pub const DEFAULT_FRAME_ORIGIN: &str = "http://localhost:4000";
pub const DEFAULT_FRAME_HEIGHT_PX: u32 = 640;

/// iframe に渡す表示設定。transparent 以外はそのまま configure で転送する
#[derive(Serialize, Deserialize, Debug, Clone, Default, PartialEq)]
pub struct EmbedOptions {
    #[serde(default)]
    pub transparent: bool,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

/// iframe とやり取りするメッセージ
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct FrameMessage {
    pub event: String,
    #[serde(default)]
    pub payload: Option<Value>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FrameUpdate {
    Resized { height_px: u32 },
}

/// 埋め込み先の指定
#[derive(Debug, Clone)]
pub struct Embed {
    selector: String,
    origin: String,
    options: EmbedOptions,
}

impl Embed {
    pub fn new(selector: &str, origin: &str) -> Result<Self, AppError> {
        if selector.trim().is_empty() {
            return Err(AppError::Configuration(format!(
                "要素 '{}' が見つかりません。埋め込みできません。",
                selector
            )));
        }
        Ok(Embed {
            selector: selector.to_string(),
            origin: origin.trim_end_matches('/').to_string(),
            options: EmbedOptions::default(),
        })
    }

    pub fn with_options(mut self, options: EmbedOptions) -> Self {
        self.options = options;
        self
    }

    /// 請求書のホストURLを指す iframe を用意する
    pub fn mount(self, invoice: &Invoice) -> Result<MountedFrame, AppError> {
        let src = invoice.invoice_url.clone().ok_or_else(|| {
            AppError::Configuration("請求書に invoice_url がありません".to_string())
        })?;
        log::debug!("iframe をマウントします: {} -> {}", self.selector, src);
        Ok(MountedFrame {
            selector: self.selector,
            origin: self.origin,
            options: self.options,
            src,
            height_px: DEFAULT_FRAME_HEIGHT_PX,
        })
    }
}

#[derive(Debug, Clone)]
pub struct MountedFrame {
    selector: String,
    origin: String,
    options: EmbedOptions,
    src: String,
    height_px: u32,
}

impl MountedFrame {
    pub fn selector(&self) -> &str {
        &self.selector
    }

    pub fn src(&self) -> &str {
        &self.src
    }

    pub fn height_px(&self) -> u32 {
        self.height_px
    }

    pub fn to_html(&self) -> String {
        let mut style = format!("width: 100%; height: {}px;", self.height_px);
        let mut extra = String::new();
        if self.options.transparent {
            style.push_str(" background-color: transparent;");
            extra.push_str(" allowtransparency=\"true\"");
        }
        format!(
            "<iframe src=\"{}\" frameborder=\"0\" style=\"{}\"{}></iframe>",
            escape_attr(&self.src),
            style,
            extra
        )
    }

    /// マウント直後に送る handshake と configure
    pub fn handshake(&self) -> Vec<FrameMessage> {
        let configure = serde_json::to_value(&self.options).unwrap_or(Value::Null);
        vec![
            FrameMessage { event: "handshake".to_string(), payload: None },
            FrameMessage { event: "configure".to_string(), payload: Some(configure) },
        ]
    }

    /// 信頼する origin からの payload 付きメッセージだけを処理する
    pub fn handle_message(&mut self, origin: &str, raw: &str) -> Option<FrameUpdate> {
        if origin.trim_end_matches('/') != self.origin {
            log::debug!("不明な origin からのメッセージを無視します: {}", origin);
            return None;
        }
        let message: FrameMessage = match serde_json::from_str(raw) {
            Ok(message) => message,
            Err(e) => {
                log::warn!("iframe メッセージを解析できません: {}", e);
                return None;
            }
        };
        let payload = match message.payload {
            Some(Value::Null) | None => return None,
            Some(payload) => payload,
        };
        log::debug!("iframe メッセージ: {} {}", message.event, payload);

        match message.event.as_str() {
            "resize" => {
                let height = payload.get("height").and_then(Value::as_f64)?;
                if height < 0.0 {
                    return None;
                }
                self.height_px = height.round() as u32;
                Some(FrameUpdate::Resized { height_px: self.height_px })
            }
            _ => None,
        }
    }
}

fn escape_attr(value: &str) -> String {
    value
        .replace('&', "&amp;")
        .replace('"', "&quot;")
        .replace('<', "&lt;")
        .replace('>', "&gt;")
}
