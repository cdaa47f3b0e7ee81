//! Built-in function catalogue.

use serde_json::Value;

use super::descriptor::{FunctionDescriptor, PromptTemplate};
use super::schema::FieldSpec;
use crate::types::{InputFields, ModelParams};

pub const TRANSLATION_ZH_TO_EN: &str = "translation_zh_to_en";
pub const TRANSLATION_EN_TO_ZH: &str = "translation_en_to_zh";
pub const TEXT_SUMMARY: &str = "text_summary";

const ZH_TO_EN_SYSTEM: &str = "你是一个专业的中英翻译助手。请将用户提供的中文文本准确、自然地翻译成英文。保持原文的语气和含义，确保翻译结果符合英语表达习惯。";
const EN_TO_ZH_SYSTEM: &str = "你是一个专业的英中翻译助手。请将用户提供的英文文本准确、自然地翻译成中文。保持原文的语气和含义，确保翻译结果符合中文表达习惯。";
const SUMMARY_SYSTEM: &str = "你是一个专业的文本总结助手。请对用户提供的文本进行智能总结，提取关键信息和要点。总结应该简洁明了，保持原文的主要内容和逻辑结构。";

fn text_of(input: &InputFields) -> &str {
    input.get("text").and_then(Value::as_str).unwrap_or_default()
}

fn summary_length_desc(input: &InputFields) -> &'static str {
    match input.get("summary_length").and_then(Value::as_str) {
        Some("short") => "简短",
        Some("long") => "详细",
        _ => "中等长度",
    }
}

fn translation_params() -> ModelParams {
    ModelParams::new().temperature(0.3).max_tokens(2000)
}

pub fn translation_zh_to_en() -> FunctionDescriptor {
    FunctionDescriptor::new(TRANSLATION_ZH_TO_EN, "中译英")
        .description("将中文文本翻译成英文")
        .system_prompt(ZH_TO_EN_SYSTEM)
        .template(PromptTemplate::custom(|input| {
            format!("请将以下中文翻译成英文：\n\n{}", text_of(input))
        }))
        .field(FieldSpec::required("text", "string").description("要翻译的中文文本"))
        .max_input_length(5000)
        .model_params(translation_params())
        .estimated_time(5.0)
}

pub fn translation_en_to_zh() -> FunctionDescriptor {
    FunctionDescriptor::new(TRANSLATION_EN_TO_ZH, "英译中")
        .description("将英文文本翻译成中文")
        .system_prompt(EN_TO_ZH_SYSTEM)
        .template(PromptTemplate::custom(|input| {
            format!("请将以下英文翻译成中文：\n\n{}", text_of(input))
        }))
        .field(FieldSpec::required("text", "string").description("要翻译的英文文本"))
        .max_input_length(5000)
        .model_params(translation_params())
        .estimated_time(5.0)
}

pub fn text_summary() -> FunctionDescriptor {
    FunctionDescriptor::new(TEXT_SUMMARY, "文本总结")
        .description("对长文本进行智能总结，提取关键信息")
        .system_prompt(SUMMARY_SYSTEM)
        .template(PromptTemplate::custom(|input| {
            format!(
                "请对以下文本进行{}总结：\n\n{}",
                summary_length_desc(input),
                text_of(input)
            )
        }))
        .field(FieldSpec::required("text", "string").description("要总结的文本"))
        .field(
            FieldSpec::optional("summary_length", "string")
                .description("总结长度")
                .enum_values(["short", "medium", "long"])
                .default_value(Value::from("medium")),
        )
        .max_input_length(10000)
        .model_params(ModelParams::new().temperature(0.5).max_tokens(1000))
        .estimated_time(8.0)
}

/// All built-in descriptors in registration order.
pub fn all() -> Vec<FunctionDescriptor> {
    vec![translation_zh_to_en(), translation_en_to_zh(), text_summary()]
}
