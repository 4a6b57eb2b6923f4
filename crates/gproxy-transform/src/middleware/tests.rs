use super::*;
use gproxy_protocol::gemini::generate_content::response::GenerateContentResponse as GeminiGenerateContentResponse;
use gproxy_protocol::gemini::generate_content::types::UsageMetadata;
use gproxy_protocol::openai::create_chat_completions::request::{
    CreateChatCompletionRequest, CreateChatCompletionRequestBody,
};
use gproxy_protocol::openai::create_chat_completions::response::{
    ChatCompletionChoice, ChatCompletionObjectType, CreateChatCompletionResponse,
};
use gproxy_protocol::openai::create_chat_completions::types::{
    ChatCompletionFinishReason, ChatCompletionRequestMessage, ChatCompletionRequestSystemMessage,
    ChatCompletionRequestUserMessage, ChatCompletionResponseMessage, ChatCompletionResponseRole,
    ChatCompletionTextContent, ChatCompletionUserContent, CompletionUsage, PromptTokensDetails,
};

#[test]
fn stream_format_basic() {
    assert_eq!(stream_format(Proto::Gemini), StreamFormat::JsonStream);
    assert_eq!(stream_format(Proto::OpenAI), StreamFormat::SseDataOnly);
}

fn make_openai_chat_request(stream: Option<bool>) -> CreateChatCompletionRequest {
    let message = ChatCompletionRequestMessage::User(ChatCompletionRequestUserMessage {
        content: ChatCompletionUserContent::Text("hi".to_string()),
        name: None,
    });

    CreateChatCompletionRequest {
        body: CreateChatCompletionRequestBody {
            messages: vec![message],
            model: "gpt-test".to_string(),
            modalities: None,
            verbosity: None,
            reasoning_effort: None,
            max_completion_tokens: None,
            frequency_penalty: None,
            presence_penalty: None,
            web_search_options: None,
            top_logprobs: None,
            response_format: None,
            audio: None,
            store: None,
            stream,
            stop: None,
            logit_bias: None,
            logprobs: None,
            max_tokens: None,
            n: None,
            prediction: None,
            seed: None,
            stream_options: None,
            tools: None,
            tool_choice: None,
            parallel_tool_calls: None,
            function_call: None,
            functions: None,
            metadata: None,
            extra_body: None,
            temperature: None,
            top_p: None,
            user: None,
            safety_identifier: None,
            prompt_cache_key: None,
            service_tier: None,
            prompt_cache_retention: None,
        },
    }
}

fn make_openai_chat_response_with_usage(usage: CompletionUsage) -> CreateChatCompletionResponse {
    let message = ChatCompletionResponseMessage {
        role: ChatCompletionResponseRole::Assistant,
        content: Some("ok".to_string()),
        refusal: None,
        tool_calls: None,
        annotations: None,
        function_call: None,
        audio: None,
    };
    let choice = ChatCompletionChoice {
        index: 0,
        message,
        finish_reason: ChatCompletionFinishReason::Stop,
        logprobs: None,
    };

    CreateChatCompletionResponse {
        id: "chatcmpl-test".to_string(),
        object: ChatCompletionObjectType::ChatCompletion,
        created: 0,
        model: "gpt-test".to_string(),
        choices: vec![choice],
        usage: Some(usage),
        service_tier: None,
        system_fingerprint: None,
    }
}

fn make_gemini_response_with_usage(usage: UsageMetadata) -> GeminiGenerateContentResponse {
    GeminiGenerateContentResponse {
        candidates: Vec::new(),
        prompt_feedback: None,
        usage_metadata: Some(usage),
        model_version: None,
        response_id: None,
        model_status: None,
    }
}

#[tokio::test]
async fn openai_stream_flag_flip_sets_include_usage() {
    let ctx = TransformContext {
        src: Proto::OpenAI,
        dst: Proto::OpenAI,
        src_op: Op::GenerateContent,
        dst_op: Op::StreamGenerateContent,
        safety_disabled: false,
    };
    let req = make_openai_chat_request(None);
    let out = transform_request(
        &ctx,
        Request::GenerateContent(GenerateContentRequest::OpenAI(req)),
    )
    .await
    .unwrap();
    let out_req = match out {
        Request::GenerateContent(GenerateContentRequest::OpenAI(req)) => req,
        _ => panic!("unexpected output"),
    };
    assert_eq!(out_req.body.stream, Some(true));
    assert_eq!(
        out_req
            .body
            .stream_options
            .as_ref()
            .and_then(|opts| opts.include_usage),
        Some(true)
    );
}

#[tokio::test]
async fn openai_to_gemini_system_message_becomes_system_instruction_by_default() {
    let mut req = make_openai_chat_request(Some(false));
    req.body.messages.insert(
        0,
        ChatCompletionRequestMessage::System(ChatCompletionRequestSystemMessage {
            content: ChatCompletionTextContent::Text("be nice".to_string()),
            name: None,
        }),
    );

    let ctx = TransformContext {
        src: Proto::OpenAI,
        dst: Proto::Gemini,
        src_op: Op::GenerateContent,
        dst_op: Op::GenerateContent,
        safety_disabled: false,
    };
    let out = transform_request(&ctx, Request::GenerateContent(GenerateContentRequest::OpenAI(req)))
        .await
        .unwrap();
    let gemini_req = match out {
        Request::GenerateContent(GenerateContentRequest::Gemini(req)) => req,
        _ => panic!("unexpected output"),
    };
    assert!(gemini_req.body.system_instruction.is_some());
    assert!(gemini_req.body.safety_settings.is_none());
    // The system text must not leak into `contents` as a user turn.
    assert!(gemini_req.body.contents.iter().all(|c| c.role != Some(
        gproxy_protocol::gemini::content::ContentRole::User
    ) || !c
        .parts
        .iter()
        .any(|p| p.text.as_deref() == Some("be nice"))));
}

#[tokio::test]
async fn openai_to_gemini_safety_disabled_downgrades_system_to_user_turn() {
    let mut req = make_openai_chat_request(Some(false));
    req.body.messages.insert(
        0,
        ChatCompletionRequestMessage::System(ChatCompletionRequestSystemMessage {
            content: ChatCompletionTextContent::Text("be nice".to_string()),
            name: None,
        }),
    );

    let ctx = TransformContext {
        src: Proto::OpenAI,
        dst: Proto::Gemini,
        src_op: Op::GenerateContent,
        dst_op: Op::GenerateContent,
        safety_disabled: true,
    };
    let out = transform_request(&ctx, Request::GenerateContent(GenerateContentRequest::OpenAI(req)))
        .await
        .unwrap();
    let gemini_req = match out {
        Request::GenerateContent(GenerateContentRequest::Gemini(req)) => req,
        _ => panic!("unexpected output"),
    };
    assert!(gemini_req.body.system_instruction.is_none());
    let safety_settings = gemini_req.body.safety_settings.expect("safety settings emitted");
    assert_eq!(safety_settings.len(), 5);
    assert!(
        gemini_req.body.contents.iter().any(|c| c
            .parts
            .iter()
            .any(|p| p.text.as_deref() == Some("be nice")))
    );
}

#[test]
fn usage_cache_mapping_openai_chat() {
    let usage = CompletionUsage {
        prompt_tokens: 10,
        completion_tokens: 5,
        total_tokens: 15,
        completion_tokens_details: None,
        prompt_tokens_details: Some(PromptTokensDetails {
            audio_tokens: None,
            cached_tokens: Some(7),
        }),
    };
    let resp = make_openai_chat_response_with_usage(usage);
    let summary =
        usage_from_response(Proto::OpenAI, &GenerateContentResponse::OpenAI(resp)).unwrap();
    assert_eq!(summary.input_tokens, Some(10));
    assert_eq!(summary.output_tokens, Some(5));
    assert_eq!(summary.cache_read_input_tokens, Some(7));
    assert_eq!(summary.cache_creation_input_tokens, None);
}

#[test]
fn usage_cache_mapping_gemini() {
    let usage = UsageMetadata {
        prompt_token_count: Some(1),
        cached_content_token_count: Some(2),
        candidates_token_count: Some(3),
        tool_use_prompt_token_count: None,
        thoughts_token_count: None,
        total_token_count: None,
        prompt_tokens_details: None,
        cache_tokens_details: None,
        candidates_tokens_details: None,
        tool_use_prompt_tokens_details: None,
    };
    let resp = make_gemini_response_with_usage(usage);
    let summary =
        usage_from_response(Proto::Gemini, &GenerateContentResponse::Gemini(resp)).unwrap();
    assert_eq!(summary.input_tokens, Some(1));
    assert_eq!(summary.output_tokens, Some(3));
    assert_eq!(summary.cache_read_input_tokens, Some(2));
    assert_eq!(summary.cache_creation_input_tokens, None);
}
