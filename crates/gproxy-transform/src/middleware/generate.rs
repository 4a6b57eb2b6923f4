use gproxy_protocol::openai::create_chat_completions::request::CreateChatCompletionRequest as OpenAIChatCompletionRequest;
use gproxy_protocol::openai::create_chat_completions::types::ChatCompletionStreamOptions;

use crate::generate_content;

use super::types::{
    GenerateContentRequest, GenerateContentResponse, Op, Proto, Request, Response,
    TransformContext, TransformError,
};

pub(crate) async fn transform_generate_request(
    ctx: &TransformContext,
    req: GenerateContentRequest,
) -> Result<Request, TransformError> {
    if !matches!(ctx.src_op, Op::GenerateContent | Op::StreamGenerateContent)
        || !matches!(ctx.dst_op, Op::GenerateContent | Op::StreamGenerateContent)
    {
        return Err(TransformError::OpMismatch);
    }

    let dst_stream = op_is_stream(ctx.dst_op);

    let result = match (ctx.src, ctx.dst, req) {
        (Proto::OpenAI, Proto::OpenAI, GenerateContentRequest::OpenAI(mut req)) => {
            set_stream_flag_openai(&mut req, dst_stream);
            GenerateContentRequest::OpenAI(req)
        }
        (Proto::OpenAI, Proto::Gemini, GenerateContentRequest::OpenAI(req)) => {
            GenerateContentRequest::Gemini(
                generate_content::openai_chat_completions2gemini::request::transform_request(
                    req,
                    ctx.safety_disabled,
                )
                .await,
            )
        }
        (Proto::Gemini, Proto::Gemini, GenerateContentRequest::Gemini(req)) => {
            GenerateContentRequest::Gemini(req)
        }
        (Proto::Gemini, Proto::OpenAI, GenerateContentRequest::Gemini(req)) => {
            let mut out =
                generate_content::gemini2openai_chat_completions::request::transform_request(req);
            set_stream_flag_openai(&mut out, dst_stream);
            GenerateContentRequest::OpenAI(out)
        }
        (src, dst, _) => {
            return Err(TransformError::UnsupportedPair {
                src,
                dst,
                src_op: ctx.src_op,
                dst_op: ctx.dst_op,
            });
        }
    };

    Ok(Request::GenerateContent(result))
}

pub(crate) fn transform_generate_response(
    ctx: &TransformContext,
    resp: GenerateContentResponse,
) -> Result<Response, TransformError> {
    if !matches!(ctx.src_op, Op::GenerateContent | Op::StreamGenerateContent)
        || !matches!(ctx.dst_op, Op::GenerateContent | Op::StreamGenerateContent)
    {
        return Err(TransformError::OpMismatch);
    }

    let result = match (ctx.src, ctx.dst, resp) {
        (Proto::OpenAI, Proto::OpenAI, GenerateContentResponse::OpenAI(resp)) => {
            GenerateContentResponse::OpenAI(resp)
        }
        (Proto::OpenAI, Proto::Gemini, GenerateContentResponse::OpenAI(resp)) => {
            GenerateContentResponse::Gemini(
                generate_content::openai_chat_completions2gemini::response::transform_response(
                    resp,
                ),
            )
        }
        (Proto::Gemini, Proto::Gemini, GenerateContentResponse::Gemini(resp)) => {
            GenerateContentResponse::Gemini(resp)
        }
        (Proto::Gemini, Proto::OpenAI, GenerateContentResponse::Gemini(resp)) => {
            GenerateContentResponse::OpenAI(
                generate_content::gemini2openai_chat_completions::response::transform_response(
                    resp,
                ),
            )
        }
        (src, dst, _) => {
            return Err(TransformError::UnsupportedPair {
                src,
                dst,
                src_op: ctx.src_op,
                dst_op: ctx.dst_op,
            });
        }
    };

    Ok(Response::GenerateContent(result))
}

pub(crate) fn op_is_stream(op: Op) -> bool {
    matches!(op, Op::StreamGenerateContent)
}

fn set_stream_flag_openai(req: &mut OpenAIChatCompletionRequest, stream: bool) {
    req.body.stream = Some(stream);
    if stream {
        let options = req
            .body
            .stream_options
            .get_or_insert(ChatCompletionStreamOptions {
                include_usage: None,
                include_obfuscation: None,
            });
        if options.include_usage.is_none() {
            options.include_usage = Some(true);
        }
    } else {
        req.body.stream_options = None;
    }
}
