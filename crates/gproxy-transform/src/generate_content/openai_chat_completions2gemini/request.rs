use gproxy_protocol::gemini::content::{
    Blob as GeminiBlob, Content as GeminiContent, ContentRole as GeminiContentRole,
    FileData as GeminiFileData, FunctionCall as GeminiFunctionCall,
    FunctionResponse as GeminiFunctionResponse, Part as GeminiPart,
};
use gproxy_protocol::gemini::generate_content::request::{
    GenerateContentPath as GeminiGenerateContentPath,
    GenerateContentRequest as GeminiGenerateContentRequest,
    GenerateContentRequestBody as GeminiGenerateContentRequestBody,
};
use gproxy_protocol::gemini::generate_content::types::{
    FunctionCallingConfig, FunctionCallingMode, FunctionDeclaration, GenerationConfig,
    GoogleSearch, HarmBlockThreshold, HarmCategory, Schema, SafetySetting, ThinkingConfig,
    Tool as GeminiTool, ToolConfig,
};
use gproxy_protocol::openai::create_chat_completions::request::CreateChatCompletionRequest;
use gproxy_protocol::openai::create_chat_completions::types::{
    AllowedToolsMode, ChatCompletionAllowedTool, ChatCompletionAllowedToolsChoice,
    ChatCompletionAssistantContent, ChatCompletionAssistantContentPart,
    ChatCompletionFunctionCallChoice, ChatCompletionFunctionCallMode,
    ChatCompletionFunctionCallOption, ChatCompletionImageDetail, ChatCompletionInputAudioFormat,
    ChatCompletionInputFile, ChatCompletionMessageToolCall, ChatCompletionRequestAssistantMessage,
    ChatCompletionRequestFunctionMessage, ChatCompletionRequestMessage,
    ChatCompletionRequestToolMessage, ChatCompletionRequestUserMessage,
    ChatCompletionResponseFormat, ChatCompletionTextContent, ChatCompletionTextContentPart,
    ChatCompletionToolChoiceMode, ChatCompletionToolChoiceOption, ChatCompletionToolDefinition,
    ChatCompletionUserContent, ChatCompletionUserContentPart, FunctionObject, ReasoningEffort,
};
use base64::Engine;
use serde_json::Value as JsonValue;
use std::collections::HashMap;
use std::time::Duration;

/// Timeout for downloading an `http(s)://` image URL before it is attached
/// to the request as inline base64 data.
const IMAGE_DOWNLOAD_TIMEOUT: Duration = Duration::from_secs(10);

/// Convert an OpenAI chat-completions request into a Gemini generate-content request.
pub async fn transform_request(
    request: CreateChatCompletionRequest,
    safety_disabled: bool,
) -> GeminiGenerateContentRequest {
    let mut model = request.body.model.clone();
    let non_thinking = model.to_ascii_lowercase().ends_with(":non-thinking");
    if non_thinking {
        let cut = model.len() - ":non-thinking".len();
        model.truncate(cut);
    }

    let model_id = model.strip_prefix("models/").unwrap_or(model.as_str());
    let is_gemma = model_id.to_ascii_lowercase().starts_with("gemma");
    let route_system_as_user = safety_disabled || is_gemma;

    let mut system_texts = Vec::new();
    let mut contents = Vec::new();
    let mut tool_call_index = 0usize;
    // tool_call_id -> function name, so a later tool-result turn can carry
    // the original call's name instead of the opaque call id.
    let mut tool_call_names: HashMap<String, String> = HashMap::new();

    for message in request.body.messages {
        match message {
            ChatCompletionRequestMessage::System(system) => {
                push_system_text(&mut system_texts, system.content);
            }
            ChatCompletionRequestMessage::Developer(developer) => {
                push_system_text(&mut system_texts, developer.content);
            }
            ChatCompletionRequestMessage::User(user) => {
                if let Some(content) = map_user_message(user).await {
                    contents.push(content);
                }
            }
            ChatCompletionRequestMessage::Assistant(assistant) => {
                if let Some(content) =
                    map_assistant_message(assistant, &mut tool_call_index, &mut tool_call_names)
                        .await
                {
                    contents.push(content);
                }
            }
            ChatCompletionRequestMessage::Tool(tool) => {
                if let Some(content) = map_tool_message(tool, &tool_call_names) {
                    contents.push(content);
                }
            }
            ChatCompletionRequestMessage::Function(function) => {
                if let Some(content) = map_function_message(function) {
                    contents.push(content);
                }
            }
        }
    }

    let system_instruction = if system_texts.is_empty() || route_system_as_user {
        None
    } else {
        Some(GeminiContent {
            role: None,
            parts: vec![GeminiPart {
                text: Some(system_texts.join("\n")),
                ..Default::default()
            }],
        })
    };

    if route_system_as_user && !system_texts.is_empty() {
        contents.insert(
            0,
            GeminiContent {
                role: Some(GeminiContentRole::User),
                parts: vec![text_part(system_texts.join("\n"))],
            },
        );
    }

    let safety_settings = if safety_disabled {
        Some(
            HarmCategory::ALL_DISABLEABLE
                .iter()
                .map(|category| SafetySetting {
                    category: *category,
                    threshold: HarmBlockThreshold::Off,
                })
                .collect(),
        )
    } else {
        None
    };

    let mut tools = map_tools(request.body.tools);
    if request.body.web_search_options.is_some() {
        tools.push(GeminiTool {
            function_declarations: None,
            google_search: Some(GoogleSearch {}),
        });
    }
    let tools = if tools.is_empty() { None } else { Some(tools) };

    let tool_config = map_tool_config(request.body.tool_choice, request.body.function_call);

    let (cached_content, extra_thinking_config) = map_extra_body(request.body.extra_body.as_ref());
    let mut generation_config = map_generation_config(
        request.body.max_completion_tokens,
        request.body.max_tokens,
        request.body.temperature,
        request.body.top_p,
        request.body.stop,
        request.body.response_format,
        request.body.reasoning_effort,
        extra_thinking_config,
        model_id,
    );

    if non_thinking {
        let config = generation_config.get_or_insert_with(|| GenerationConfig {
            stop_sequences: None,
            response_mime_type: None,
            response_schema: None,
            candidate_count: None,
            max_output_tokens: None,
            temperature: None,
            top_p: None,
            top_k: None,
            thinking_config: None,
        });
        config.thinking_config = Some(ThinkingConfig {
            include_thoughts: Some(false),
            thinking_budget: Some(0),
        });
    }

    GeminiGenerateContentRequest {
        path: GeminiGenerateContentPath { model },
        body: GeminiGenerateContentRequestBody {
            contents,
            tools,
            tool_config,
            safety_settings,
            system_instruction,
            generation_config,
            cached_content,
        },
    }
}

async fn map_user_message(message: ChatCompletionRequestUserMessage) -> Option<GeminiContent> {
    let parts = map_user_content_to_parts(message.content).await;
    if parts.is_empty() {
        None
    } else {
        Some(GeminiContent {
            parts,
            role: Some(GeminiContentRole::User),
        })
    }
}

async fn map_assistant_message(
    message: ChatCompletionRequestAssistantMessage,
    tool_call_index: &mut usize,
    tool_call_names: &mut HashMap<String, String>,
) -> Option<GeminiContent> {
    let mut parts = Vec::new();

    if let Some(content) = message.content {
        parts.extend(map_assistant_content_to_parts(content).await);
    }

    if let Some(refusal) = message.refusal
        && !refusal.is_empty()
    {
        parts.push(text_part(refusal));
    }

    if let Some(tool_calls) = message.tool_calls {
        for call in tool_calls {
            let (call_id, call_name) = match &call {
                ChatCompletionMessageToolCall::Function { id, function } => {
                    (id.clone(), function.name.clone())
                }
                ChatCompletionMessageToolCall::Custom { id, custom } => {
                    (id.clone(), custom.name.clone())
                }
            };
            tool_call_names.insert(call_id, call_name);
            if let Some(part) = map_tool_call_to_part(call, tool_call_index) {
                parts.push(part);
            }
        }
    }

    if let Some(function_call) = message.function_call {
        let args = serde_json::from_str(&function_call.arguments)
            .unwrap_or(JsonValue::String(function_call.arguments));
        parts.push(GeminiPart {
            function_call: Some(GeminiFunctionCall {
                id: Some(next_tool_call_id(tool_call_index)),
                name: function_call.name,
                args,
            }),
            ..Default::default()
        });
    }

    if parts.is_empty() {
        None
    } else {
        Some(GeminiContent {
            parts,
            role: Some(GeminiContentRole::Model),
        })
    }
}

/// Parses a tool/function result as JSON when possible, matching the
/// upstream `functionResponse.response` contract (`parsed-JSON-or-string-wrapped`).
fn parse_or_wrap_response(text: String) -> JsonValue {
    serde_json::from_str(&text).unwrap_or(JsonValue::String(text))
}

fn map_tool_message(
    message: ChatCompletionRequestToolMessage,
    tool_call_names: &HashMap<String, String>,
) -> Option<GeminiContent> {
    let response_text = map_text_content_to_string(message.content)?;
    let tool_call_id = message.tool_call_id;
    let name = tool_call_names
        .get(&tool_call_id)
        .cloned()
        .unwrap_or_else(|| tool_call_id.clone());
    let part = GeminiPart {
        function_response: Some(GeminiFunctionResponse {
            id: Some(tool_call_id),
            name,
            response: parse_or_wrap_response(response_text),
        }),
        ..Default::default()
    };
    Some(GeminiContent {
        parts: vec![part],
        role: Some(GeminiContentRole::Function),
    })
}

fn map_function_message(message: ChatCompletionRequestFunctionMessage) -> Option<GeminiContent> {
    let response = message
        .content
        .map(parse_or_wrap_response)
        .unwrap_or(JsonValue::Null);
    let part = GeminiPart {
        function_response: Some(GeminiFunctionResponse {
            id: None,
            name: message.name,
            response,
        }),
        ..Default::default()
    };
    Some(GeminiContent {
        parts: vec![part],
        role: Some(GeminiContentRole::Function),
    })
}

async fn map_user_content_to_parts(content: ChatCompletionUserContent) -> Vec<GeminiPart> {
    let mut parts = Vec::new();
    match content {
        ChatCompletionUserContent::Text(text) => {
            if !text.is_empty() {
                parts.push(text_part(text));
            }
        }
        ChatCompletionUserContent::Parts(items) => {
            for item in items {
                match item {
                    ChatCompletionUserContentPart::Text { text } => {
                        if !text.is_empty() {
                            parts.push(text_part(text));
                        }
                    }
                    ChatCompletionUserContentPart::ImageUrl { image_url } => {
                        parts.push(map_image_url(image_url.url, image_url.detail).await);
                    }
                    ChatCompletionUserContentPart::InputAudio { input_audio } => {
                        parts.push(map_input_audio(input_audio.format, input_audio.data));
                    }
                    ChatCompletionUserContentPart::File { file } => {
                        parts.push(map_input_file(file));
                    }
                }
            }
        }
    }
    parts
}

async fn map_assistant_content_to_parts(content: ChatCompletionAssistantContent) -> Vec<GeminiPart> {
    let mut parts = Vec::new();
    match content {
        ChatCompletionAssistantContent::Text(text) => {
            if !text.is_empty() {
                parts.push(text_part(text));
            }
        }
        ChatCompletionAssistantContent::Parts(items) => {
            for item in items {
                match item {
                    ChatCompletionAssistantContentPart::Text { text } => {
                        if !text.is_empty() {
                            parts.push(text_part(text));
                        }
                    }
                    ChatCompletionAssistantContentPart::Refusal { refusal } => {
                        if !refusal.is_empty() {
                            parts.push(text_part(refusal));
                        }
                    }
                }
            }
        }
    }
    parts
}

fn map_tool_call_to_part(
    call: ChatCompletionMessageToolCall,
    _tool_call_index: &mut usize,
) -> Option<GeminiPart> {
    match call {
        ChatCompletionMessageToolCall::Function { id, function } => {
            let args = serde_json::from_str(&function.arguments)
                .unwrap_or(JsonValue::String(function.arguments));
            Some(GeminiPart {
                function_call: Some(GeminiFunctionCall {
                    id: Some(id),
                    name: function.name,
                    args,
                }),
                ..Default::default()
            })
        }
        ChatCompletionMessageToolCall::Custom { id, custom } => Some(GeminiPart {
            function_call: Some(GeminiFunctionCall {
                id: Some(id),
                name: custom.name,
                args: JsonValue::String(custom.input),
            }),
            ..Default::default()
        }),
    }
}

async fn map_image_url(url: String, detail: Option<ChatCompletionImageDetail>) -> GeminiPart {
    let _ = detail;
    if let Some((mime, data)) = parse_data_url(&url) {
        return GeminiPart {
            inline_data: Some(GeminiBlob {
                mime_type: mime,
                data,
            }),
            ..Default::default()
        };
    }

    if let Some(rest) = url.strip_prefix("gs://") {
        let _ = rest;
        return GeminiPart {
            file_data: Some(GeminiFileData {
                mime_type: mime_type_from_extension(&url),
                file_uri: url,
            }),
            ..Default::default()
        };
    }

    if url.starts_with("http://") || url.starts_with("https://") {
        return match download_image(&url).await {
            Some((mime, data)) => GeminiPart {
                inline_data: Some(GeminiBlob {
                    mime_type: mime,
                    data,
                }),
                ..Default::default()
            },
            None => {
                eprintln!("openai_chat_completions2gemini: failed to download image url {url}");
                text_part(format!("[image unavailable: {url}]"))
            }
        };
    }

    eprintln!("openai_chat_completions2gemini: unsupported image url scheme {url}");
    text_part(format!("[unsupported image url: {url}]"))
}

/// Best-effort mime type from a URL/path extension, used for `gs://` references
/// that cannot be fetched to sniff content type.
fn mime_type_from_extension(url: &str) -> Option<String> {
    let path = url.split(['?', '#']).next().unwrap_or(url);
    let ext = path.rsplit('.').next()?.to_ascii_lowercase();
    let mime = match ext.as_str() {
        "png" => "image/png",
        "jpg" | "jpeg" => "image/jpeg",
        "gif" => "image/gif",
        "webp" => "image/webp",
        "heic" => "image/heic",
        "heif" => "image/heif",
        _ => return None,
    };
    Some(mime.to_string())
}

/// Downloads an `http(s)://` image within [`IMAGE_DOWNLOAD_TIMEOUT`] and returns
/// `(mime_type, base64_data)` for inlining into the request.
async fn download_image(url: &str) -> Option<(String, String)> {
    let client = wreq::Client::builder()
        .timeout(IMAGE_DOWNLOAD_TIMEOUT)
        .build()
        .ok()?;
    let response = client.get(url).send().await.ok()?;
    let mime_type = response
        .headers()
        .get("content-type")
        .and_then(|value| value.to_str().ok())
        .map(|value| value.split(';').next().unwrap_or(value).trim().to_string())
        .or_else(|| mime_type_from_extension(url))
        .unwrap_or_else(|| "application/octet-stream".to_string());
    let bytes = response.bytes().await.ok()?;
    Some((
        mime_type,
        base64::engine::general_purpose::STANDARD.encode(bytes),
    ))
}

fn map_input_audio(format: ChatCompletionInputAudioFormat, data: String) -> GeminiPart {
    let mime_type = match format {
        ChatCompletionInputAudioFormat::Wav => "audio/wav",
        ChatCompletionInputAudioFormat::Mp3 => "audio/mpeg",
    };
    GeminiPart {
        inline_data: Some(GeminiBlob {
            mime_type: mime_type.to_string(),
            data,
        }),
        ..Default::default()
    }
}

fn map_input_file(file: ChatCompletionInputFile) -> GeminiPart {
    if let Some(file_id) = file.file_id {
        return GeminiPart {
            file_data: Some(GeminiFileData {
                mime_type: None,
                file_uri: file_id,
            }),
            ..Default::default()
        };
    }

    if let Some(data) = file.file_data {
        return GeminiPart {
            inline_data: Some(GeminiBlob {
                mime_type: "application/octet-stream".to_string(),
                data,
            }),
            ..Default::default()
        };
    }

    GeminiPart {
        text: Some(format!(
            "[file:{}]",
            file.filename.unwrap_or_else(|| "file".to_string())
        )),
        ..Default::default()
    }
}

fn map_text_content_to_string(content: ChatCompletionTextContent) -> Option<String> {
    match content {
        ChatCompletionTextContent::Text(text) => {
            if text.is_empty() {
                None
            } else {
                Some(text)
            }
        }
        ChatCompletionTextContent::Parts(parts) => {
            let texts: Vec<String> = parts
                .into_iter()
                .filter_map(|part| match part {
                    ChatCompletionTextContentPart::Text { text } => {
                        if text.is_empty() {
                            None
                        } else {
                            Some(text)
                        }
                    }
                })
                .collect();
            if texts.is_empty() {
                None
            } else {
                Some(texts.join("\n"))
            }
        }
    }
}

fn map_tools(tools: Option<Vec<ChatCompletionToolDefinition>>) -> Vec<GeminiTool> {
    let tools = match tools {
        Some(tools) => tools,
        None => return Vec::new(),
    };

    let mut function_declarations = Vec::new();
    for tool in tools {
        match tool {
            ChatCompletionToolDefinition::Function { function } => {
                function_declarations.push(map_function_declaration(function));
            }
            ChatCompletionToolDefinition::Custom { custom } => {
                function_declarations.push(FunctionDeclaration {
                    name: custom.name,
                    description: custom.description.unwrap_or_default(),
                    parameters: None,
                });
            }
        }
    }

    if function_declarations.is_empty() {
        Vec::new()
    } else {
        vec![GeminiTool {
            function_declarations: Some(function_declarations),
            google_search: None,
        }]
    }
}

fn map_function_declaration(function: FunctionObject) -> FunctionDeclaration {
    let parameters: Option<Schema> = function
        .parameters
        .and_then(|schema| serde_json::to_value(schema).ok())
        .and_then(|value| serde_json::from_value(value).ok());

    FunctionDeclaration {
        name: function.name,
        description: function.description.unwrap_or_default(),
        parameters,
    }
}

fn map_tool_config(
    tool_choice: Option<ChatCompletionToolChoiceOption>,
    function_call: Option<ChatCompletionFunctionCallChoice>,
) -> Option<ToolConfig> {
    let config = tool_choice
        .and_then(map_tool_choice)
        .or_else(|| map_function_call_choice(function_call))?;

    Some(ToolConfig {
        function_calling_config: Some(config),
    })
}

fn map_tool_choice(choice: ChatCompletionToolChoiceOption) -> Option<FunctionCallingConfig> {
    match choice {
        ChatCompletionToolChoiceOption::Mode(mode) => Some(FunctionCallingConfig {
            mode: Some(match mode {
                ChatCompletionToolChoiceMode::None => FunctionCallingMode::None,
                ChatCompletionToolChoiceMode::Auto => FunctionCallingMode::Auto,
                ChatCompletionToolChoiceMode::Required => FunctionCallingMode::Any,
            }),
            allowed_function_names: None,
        }),
        ChatCompletionToolChoiceOption::AllowedTools(allowed) => map_allowed_tools_choice(allowed),
        ChatCompletionToolChoiceOption::NamedTool(named) => Some(FunctionCallingConfig {
            mode: Some(FunctionCallingMode::Any),
            allowed_function_names: Some(vec![named.function.name]),
        }),
        ChatCompletionToolChoiceOption::NamedCustomTool(named) => Some(FunctionCallingConfig {
            mode: Some(FunctionCallingMode::Any),
            allowed_function_names: Some(vec![named.custom.name]),
        }),
    }
}

fn map_allowed_tools_choice(
    allowed: ChatCompletionAllowedToolsChoice,
) -> Option<FunctionCallingConfig> {
    let mut names = Vec::new();
    for tool in allowed.allowed_tools.tools {
        match tool {
            ChatCompletionAllowedTool::Function { function } => names.push(function.name),
            ChatCompletionAllowedTool::Custom { custom } => names.push(custom.name),
        }
    }

    let mode = match allowed.allowed_tools.mode {
        AllowedToolsMode::Auto => FunctionCallingMode::Auto,
        AllowedToolsMode::Required => FunctionCallingMode::Any,
    };

    Some(FunctionCallingConfig {
        mode: Some(mode),
        allowed_function_names: if names.is_empty() { None } else { Some(names) },
    })
}

fn map_function_call_choice(
    choice: Option<ChatCompletionFunctionCallChoice>,
) -> Option<FunctionCallingConfig> {
    match choice? {
        ChatCompletionFunctionCallChoice::Mode(mode) => Some(FunctionCallingConfig {
            mode: Some(match mode {
                ChatCompletionFunctionCallMode::None => FunctionCallingMode::None,
                ChatCompletionFunctionCallMode::Auto => FunctionCallingMode::Auto,
            }),
            allowed_function_names: None,
        }),
        ChatCompletionFunctionCallChoice::Named(ChatCompletionFunctionCallOption { name }) => {
            Some(FunctionCallingConfig {
                mode: Some(FunctionCallingMode::Any),
                allowed_function_names: Some(vec![name]),
            })
        }
    }
}

#[allow(clippy::too_many_arguments)]
fn map_generation_config(
    max_completion_tokens: Option<i64>,
    max_tokens: Option<i64>,
    temperature: Option<f64>,
    top_p: Option<f64>,
    stop: Option<gproxy_protocol::openai::create_chat_completions::request::StopConfiguration>,
    response_format: Option<ChatCompletionResponseFormat>,
    reasoning_effort: Option<ReasoningEffort>,
    extra_thinking_config: Option<ThinkingConfig>,
    model_id: &str,
) -> Option<GenerationConfig> {
    let max_output_tokens = max_completion_tokens
        .or(max_tokens)
        .map(|value| value.max(0) as u32);

    let stop_sequences = match stop {
        Some(
            gproxy_protocol::openai::create_chat_completions::request::StopConfiguration::Single(
                value,
            ),
        ) => Some(vec![value]),
        Some(
            gproxy_protocol::openai::create_chat_completions::request::StopConfiguration::Many(
                values,
            ),
        ) => Some(values),
        None => None,
    };

    let (response_schema, response_mime_type) = map_response_format(response_format);

    let thinking_config =
        extra_thinking_config.or_else(|| map_thinking_config(reasoning_effort, model_id));

    if max_output_tokens.is_none()
        && temperature.is_none()
        && top_p.is_none()
        && stop_sequences.is_none()
        && response_schema.is_none()
        && response_mime_type.is_none()
        && thinking_config.is_none()
    {
        return None;
    }

    Some(GenerationConfig {
        stop_sequences,
        response_mime_type,
        response_schema,
        candidate_count: None,
        max_output_tokens,
        temperature,
        top_p,
        top_k: None,
        thinking_config,
    })
}

fn map_response_format(
    format: Option<ChatCompletionResponseFormat>,
) -> (Option<Schema>, Option<String>) {
    match format {
        Some(ChatCompletionResponseFormat::JsonSchema { json_schema }) => {
            let schema = json_schema.schema.and_then(|schema| {
                serde_json::to_value(schema)
                    .ok()
                    .and_then(|value| serde_json::from_value(value).ok())
            });
            (schema, None)
        }
        Some(ChatCompletionResponseFormat::JsonObject) => {
            (None, Some("application/json".to_string()))
        }
        _ => (None, None),
    }
}

fn map_thinking_config(
    reasoning_effort: Option<ReasoningEffort>,
    model_id: &str,
) -> Option<ThinkingConfig> {
    let effort = reasoning_effort?;
    let model_id = model_id.to_ascii_lowercase();
    let is_pro = model_id.contains("pro");

    let budget = match effort {
        ReasoningEffort::None => {
            if is_pro {
                return None;
            }
            0
        }
        ReasoningEffort::Minimal | ReasoningEffort::Low => 1024,
        ReasoningEffort::Medium => 8192,
        ReasoningEffort::High | ReasoningEffort::XHigh => 24576,
    };

    Some(ThinkingConfig {
        include_thoughts: Some(budget > 0),
        thinking_budget: Some(budget),
    })
}

fn map_extra_body(extra_body: Option<&JsonValue>) -> (Option<String>, Option<ThinkingConfig>) {
    let extra_body = match extra_body.and_then(|value| value.as_object()) {
        Some(value) => value,
        None => return (None, None),
    };
    let google = match extra_body.get("google").and_then(|value| value.as_object()) {
        Some(value) => value,
        None => return (None, None),
    };

    let cached_content = google
        .get("cached_content")
        .and_then(|value| value.as_str())
        .map(|value| value.to_string());

    let thinking_config = google
        .get("thinking_config")
        .and_then(map_thinking_config_from_value);

    (cached_content, thinking_config)
}

fn map_thinking_config_from_value(value: &JsonValue) -> Option<ThinkingConfig> {
    let object = value.as_object()?;
    let include_thoughts = object
        .get("include_thoughts")
        .and_then(|value| value.as_bool());
    let thinking_budget = object
        .get("thinking_budget")
        .and_then(|value| value.as_i64())
        .map(|value| value as i32);

    Some(ThinkingConfig {
        include_thoughts,
        thinking_budget,
    })
}

fn push_system_text(output: &mut Vec<String>, content: ChatCompletionTextContent) {
    match content {
        ChatCompletionTextContent::Text(text) => {
            if !text.is_empty() {
                output.push(text);
            }
        }
        ChatCompletionTextContent::Parts(parts) => {
            for part in parts {
                let ChatCompletionTextContentPart::Text { text } = part;
                if !text.is_empty() {
                    output.push(text);
                }
            }
        }
    }
}

fn text_part(text: String) -> GeminiPart {
    GeminiPart {
        text: Some(text),
        ..Default::default()
    }
}

fn parse_data_url(url: &str) -> Option<(String, String)> {
    let url = url.strip_prefix("data:")?;
    let (meta, data) = url.split_once(",")?;
    let (mime, encoding) = meta.split_once(";")?;
    if encoding != "base64" {
        return None;
    }
    Some((mime.to_string(), data.to_string()))
}

fn next_tool_call_id(counter: &mut usize) -> String {
    let id = format!("tool_call_{}", counter);
    *counter += 1;
    id
}
