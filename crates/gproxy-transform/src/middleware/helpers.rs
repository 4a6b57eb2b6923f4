use super::types::{Op, TransformContext, TransformError};

pub(crate) fn ensure_generate_op(ctx: &TransformContext) -> Result<(), TransformError> {
    if !matches!(ctx.src_op, Op::GenerateContent | Op::StreamGenerateContent)
        || !matches!(ctx.dst_op, Op::GenerateContent | Op::StreamGenerateContent)
    {
        return Err(TransformError::OpMismatch);
    }
    Ok(())
}
