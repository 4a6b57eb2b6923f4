use super::helpers::ensure_generate_op;
use super::ops::transform_response;
use super::types::{
    GenerateContentResponse, Op, Proto, Response, StreamEvent, TransformContext, TransformError,
};

use crate::generate_content;
use crate::stream2nostream;

pub enum StreamTransformer {
    Passthrough(Proto),
    OpenAIToGemini(generate_content::openai_chat_completions2gemini::stream::OpenAIChatCompletionToGeminiStreamState),
    GeminiToOpenAI(generate_content::gemini2openai_chat_completions::stream::GeminiToOpenAIChatCompletionStreamState),
}

impl StreamTransformer {
    pub fn new(ctx: &TransformContext) -> Result<Self, TransformError> {
        ensure_generate_op(ctx)?;
        if ctx.src_op != Op::StreamGenerateContent || ctx.dst_op != Op::StreamGenerateContent {
            return Err(TransformError::StreamMismatch);
        }

        if ctx.src == ctx.dst {
            return Ok(StreamTransformer::Passthrough(ctx.src));
        }

        let transformer = match (ctx.src, ctx.dst) {
            (Proto::OpenAI, Proto::Gemini) => StreamTransformer::OpenAIToGemini(
                generate_content::openai_chat_completions2gemini::stream::OpenAIChatCompletionToGeminiStreamState::new(),
            ),
            (Proto::Gemini, Proto::OpenAI) => StreamTransformer::GeminiToOpenAI(
                generate_content::gemini2openai_chat_completions::stream::GeminiToOpenAIChatCompletionStreamState::new(),
            ),
            _ => {
                return Err(TransformError::UnsupportedPair {
                    src: ctx.src,
                    dst: ctx.dst,
                    src_op: ctx.src_op,
                    dst_op: ctx.dst_op,
                });
            }
        };

        Ok(transformer)
    }

    pub fn push(&mut self, event: StreamEvent) -> Result<Vec<StreamEvent>, TransformError> {
        match self {
            StreamTransformer::Passthrough(proto) => match (proto, event) {
                (Proto::OpenAI, StreamEvent::OpenAI(event)) => Ok(vec![StreamEvent::OpenAI(event)]),
                (Proto::Gemini, StreamEvent::Gemini(event)) => Ok(vec![StreamEvent::Gemini(event)]),
                _ => Err(TransformError::ProtoMismatch),
            },
            StreamTransformer::OpenAIToGemini(state) => match event {
                StreamEvent::OpenAI(event) => Ok(state
                    .transform_event(event)
                    .into_iter()
                    .map(StreamEvent::Gemini)
                    .collect()),
                _ => Err(TransformError::ProtoMismatch),
            },
            StreamTransformer::GeminiToOpenAI(state) => match event {
                StreamEvent::Gemini(event) => Ok(state
                    .transform_response(event)
                    .into_iter()
                    .map(StreamEvent::OpenAI)
                    .collect()),
                _ => Err(TransformError::ProtoMismatch),
            },
        }
    }
}

pub struct StreamToNostream {
    transformer: StreamTransformer,
    accumulator: TargetAccumulator,
}

impl StreamToNostream {
    pub fn new(ctx: &TransformContext) -> Result<Self, TransformError> {
        if ctx.src_op != Op::StreamGenerateContent || ctx.dst_op != Op::GenerateContent {
            return Err(TransformError::StreamMismatch);
        }
        let mut stream_ctx = *ctx;
        stream_ctx.dst_op = Op::StreamGenerateContent;
        let transformer = StreamTransformer::new(&stream_ctx)?;
        let accumulator = TargetAccumulator::new(ctx.dst)?;
        Ok(Self {
            transformer,
            accumulator,
        })
    }

    pub fn push(&mut self, event: StreamEvent) -> Result<Option<Response>, TransformError> {
        let events = self.transformer.push(event)?;
        let mut output = None;
        for event in events {
            if let Some(resp) = self.accumulator.push(event)? {
                output = Some(Response::GenerateContent(resp));
            }
        }
        Ok(output)
    }

    pub fn finalize(&mut self) -> Result<Option<Response>, TransformError> {
        Ok(self.accumulator.finalize().map(Response::GenerateContent))
    }

    pub fn finalize_on_eof(&mut self) -> Result<Option<Response>, TransformError> {
        Ok(self
            .accumulator
            .finalize_on_eof()
            .map(Response::GenerateContent))
    }
}

pub struct NostreamToStream {
    ctx: TransformContext,
}

impl NostreamToStream {
    pub fn new(ctx: &TransformContext) -> Result<Self, TransformError> {
        if ctx.src_op != Op::GenerateContent || ctx.dst_op != Op::StreamGenerateContent {
            return Err(TransformError::StreamMismatch);
        }
        Ok(Self { ctx: *ctx })
    }

    pub fn transform_response(
        &mut self,
        resp: Response,
    ) -> Result<Vec<StreamEvent>, TransformError> {
        let ctx = TransformContext {
            src: self.ctx.src,
            dst: self.ctx.dst,
            src_op: Op::GenerateContent,
            dst_op: Op::GenerateContent,
            safety_disabled: self.ctx.safety_disabled,
        };
        let resp = transform_response(&ctx, resp)?;
        let resp = match resp {
            Response::GenerateContent(resp) => resp,
            _ => return Err(TransformError::OpMismatch),
        };
        Ok(streamify_response(self.ctx.dst, resp))
    }
}

enum TargetAccumulator {
    OpenAI(stream2nostream::openai_chat_completions::OpenAIChatCompletionStreamToResponseState),
    Gemini(stream2nostream::gemini::GeminiStreamToResponseState),
}

impl TargetAccumulator {
    fn new(proto: Proto) -> Result<Self, TransformError> {
        match proto {
            Proto::OpenAI => Ok(TargetAccumulator::OpenAI(
                stream2nostream::openai_chat_completions::OpenAIChatCompletionStreamToResponseState::new(),
            )),
            Proto::Gemini => Ok(TargetAccumulator::Gemini(
                stream2nostream::gemini::GeminiStreamToResponseState::new(),
            )),
        }
    }

    fn push(
        &mut self,
        event: StreamEvent,
    ) -> Result<Option<GenerateContentResponse>, TransformError> {
        match (self, event) {
            (TargetAccumulator::OpenAI(state), StreamEvent::OpenAI(event)) => Ok(state
                .push_chunk(event)
                .map(GenerateContentResponse::OpenAI)),
            (TargetAccumulator::Gemini(state), StreamEvent::Gemini(event)) => {
                Ok(state.push_chunk(event).map(GenerateContentResponse::Gemini))
            }
            _ => Err(TransformError::ProtoMismatch),
        }
    }

    fn finalize(&mut self) -> Option<GenerateContentResponse> {
        match self {
            TargetAccumulator::OpenAI(state) => {
                Some(GenerateContentResponse::OpenAI(state.finalize()))
            }
            TargetAccumulator::Gemini(state) => {
                Some(GenerateContentResponse::Gemini(state.finalize()))
            }
        }
    }

    fn finalize_on_eof(&mut self) -> Option<GenerateContentResponse> {
        match self {
            TargetAccumulator::OpenAI(state) => {
                Some(GenerateContentResponse::OpenAI(state.finalize_on_eof()))
            }
            TargetAccumulator::Gemini(state) => {
                Some(GenerateContentResponse::Gemini(state.finalize_on_eof()))
            }
        }
    }
}

fn streamify_response(proto: Proto, resp: GenerateContentResponse) -> Vec<StreamEvent> {
    match (proto, resp) {
        (Proto::OpenAI, GenerateContentResponse::OpenAI(resp)) => streamify_openai_chat(resp)
            .into_iter()
            .map(StreamEvent::OpenAI)
            .collect(),
        (Proto::Gemini, GenerateContentResponse::Gemini(resp)) => {
            vec![StreamEvent::Gemini(resp)]
        }
        _ => Vec::new(),
    }
}

fn streamify_openai_chat(
    response: gproxy_protocol::openai::create_chat_completions::response::CreateChatCompletionResponse,
) -> Vec<gproxy_protocol::openai::create_chat_completions::stream::CreateChatCompletionStreamResponse>
{
    use gproxy_protocol::openai::create_chat_completions::stream::{
        ChatCompletionChunkObjectType, ChatCompletionStreamChoice,
        CreateChatCompletionStreamResponse,
    };
    use gproxy_protocol::openai::create_chat_completions::types::{
        ChatCompletionFunctionCallDelta, ChatCompletionMessageToolCall,
        ChatCompletionMessageToolCallChunk, ChatCompletionMessageToolCallChunkFunction,
        ChatCompletionResponseMessage, ChatCompletionResponseRole, ChatCompletionRole,
        ChatCompletionStreamResponseDelta, ChatCompletionToolCallChunkType, CompletionUsage,
    };

    fn map_chat_role(role: ChatCompletionResponseRole) -> ChatCompletionRole {
        match role {
            ChatCompletionResponseRole::Assistant => ChatCompletionRole::Assistant,
        }
    }

    fn map_tool_call_chunk(
        index: i64,
        call: &ChatCompletionMessageToolCall,
    ) -> ChatCompletionMessageToolCallChunk {
        match call {
            ChatCompletionMessageToolCall::Function { id, function } => {
                ChatCompletionMessageToolCallChunk {
                    index,
                    id: Some(id.clone()),
                    r#type: Some(ChatCompletionToolCallChunkType::Function),
                    function: Some(ChatCompletionMessageToolCallChunkFunction {
                        name: Some(function.name.clone()),
                        arguments: Some(function.arguments.clone()),
                    }),
                }
            }
            ChatCompletionMessageToolCall::Custom { id, custom } => {
                ChatCompletionMessageToolCallChunk {
                    index,
                    id: Some(id.clone()),
                    r#type: Some(ChatCompletionToolCallChunkType::Function),
                    function: Some(ChatCompletionMessageToolCallChunkFunction {
                        name: Some(custom.name.clone()),
                        arguments: Some(custom.input.clone()),
                    }),
                }
            }
        }
    }

    fn stream_delta_from_message(
        message: &ChatCompletionResponseMessage,
    ) -> ChatCompletionStreamResponseDelta {
        ChatCompletionStreamResponseDelta {
            role: Some(map_chat_role(message.role)),
            content: message.content.clone(),
            reasoning_content: None,
            function_call: message
                .function_call
                .as_ref()
                .map(|call| ChatCompletionFunctionCallDelta {
                    name: Some(call.name.clone()),
                    arguments: Some(call.arguments.clone()),
                }),
            tool_calls: message.tool_calls.as_ref().map(|calls| {
                calls
                    .iter()
                    .enumerate()
                    .map(|(idx, call)| map_tool_call_chunk(idx as i64, call))
                    .collect()
            }),
            refusal: message.refusal.clone(),
            obfuscation: None,
        }
    }

    fn make_chat_stream_response(
        response: &gproxy_protocol::openai::create_chat_completions::response::CreateChatCompletionResponse,
        choices: Vec<ChatCompletionStreamChoice>,
        usage: Option<CompletionUsage>,
    ) -> CreateChatCompletionStreamResponse {
        CreateChatCompletionStreamResponse {
            id: response.id.clone(),
            object: ChatCompletionChunkObjectType::ChatCompletionChunk,
            created: response.created,
            model: response.model.clone(),
            choices,
            usage,
            service_tier: response.service_tier,
            system_fingerprint: response.system_fingerprint.clone(),
        }
    }

    let mut events = Vec::new();

    for choice in &response.choices {
        let delta = stream_delta_from_message(&choice.message);
        let stream_choice = ChatCompletionStreamChoice {
            index: choice.index,
            delta,
            logprobs: choice.logprobs.clone(),
            finish_reason: None,
        };

        events.push(make_chat_stream_response(
            &response,
            vec![stream_choice],
            None,
        ));

        let finish_choice = ChatCompletionStreamChoice {
            index: choice.index,
            delta: ChatCompletionStreamResponseDelta {
                role: None,
                content: None,
                reasoning_content: None,
                function_call: None,
                tool_calls: None,
                refusal: None,
                obfuscation: None,
            },
            logprobs: choice.logprobs.clone(),
            finish_reason: Some(choice.finish_reason),
        };

        events.push(make_chat_stream_response(
            &response,
            vec![finish_choice],
            response.usage.clone(),
        ));
    }

    events
}
