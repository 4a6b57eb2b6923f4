use serde::{Deserialize, Serialize};

use gproxy_protocol::gemini::generate_content::request::GenerateContentRequest as GeminiGenerateContentRequest;
use gproxy_protocol::gemini::generate_content::response::GenerateContentResponse as GeminiGenerateContentResponse;
use gproxy_protocol::openai::create_chat_completions::request::CreateChatCompletionRequest as OpenAIChatCompletionRequest;
use gproxy_protocol::openai::create_chat_completions::response::CreateChatCompletionResponse as OpenAIChatCompletionResponse;
use gproxy_protocol::openai::create_chat_completions::stream::CreateChatCompletionStreamResponse;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Proto {
    #[serde(rename = "openai")]
    OpenAI,
    #[serde(rename = "gemini")]
    Gemini,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Op {
    GenerateContent,
    StreamGenerateContent,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct TransformContext {
    pub src: Proto,
    pub dst: Proto,
    pub src_op: Op,
    pub dst_op: Op,
    /// Worker-key override for this request: when `true`, the OpenAI-to-Gemini
    /// request transform emits explicit safety settings disabling all harm
    /// categories, and routes `system` messages as a `user` turn instead of
    /// `systemInstruction` (same fallback the `gemma` model family needs).
    #[serde(default)]
    pub safety_disabled: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StreamFormat {
    SseDataOnly,
    JsonStream,
}

pub fn stream_format(proto: Proto) -> StreamFormat {
    match proto {
        Proto::OpenAI => StreamFormat::SseDataOnly,
        Proto::Gemini => StreamFormat::JsonStream,
    }
}

#[derive(Debug, Clone)]
pub enum Request {
    GenerateContent(GenerateContentRequest),
}

#[derive(Debug, Clone)]
pub enum Response {
    GenerateContent(GenerateContentResponse),
}

#[derive(Debug, Clone)]
pub enum GenerateContentRequest {
    OpenAI(OpenAIChatCompletionRequest),
    Gemini(GeminiGenerateContentRequest),
}

#[allow(clippy::large_enum_variant)]
#[derive(Debug, Clone)]
pub enum GenerateContentResponse {
    OpenAI(OpenAIChatCompletionResponse),
    Gemini(GeminiGenerateContentResponse),
}

#[allow(clippy::large_enum_variant)]
#[derive(Debug, Clone)]
pub enum StreamEvent {
    OpenAI(CreateChatCompletionStreamResponse),
    Gemini(GeminiGenerateContentResponse),
}

#[derive(Debug, Clone)]
pub enum TransformError {
    OpMismatch,
    ProtoMismatch,
    StreamMismatch,
    UnsupportedPair {
        src: Proto,
        dst: Proto,
        src_op: Op,
        dst_op: Op,
    },
}
