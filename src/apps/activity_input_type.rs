//! Activities receiving byte arrays, scalars, strings and structured inputs.
use std::fmt;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use super::{AppEnv, Registries};
use crate::OrchestrationContext;

pub const ACTIVITY_INPUT_TYPE_ORCHESTRATOR: &str = "ActivityInputTypeOrchestrator";

pub const BYTE_ARRAY_INPUT: &str = "byte_array_input";
pub const SINGLE_BYTE_INPUT: &str = "single_byte_input";
pub const CUSTOM_CLASS_INPUT: &str = "custom_class_input";
pub const INT_ARRAY_INPUT: &str = "int_array_input";
pub const STRING_INPUT: &str = "string_input";
pub const CUSTOM_CLASS_ARRAY_INPUT: &str = "custom_class_array_input";

/// Structured activity input; the duration travels as `hh:mm:ss`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct CustomClass {
    pub name: String,
    pub age: u32,
    #[serde(default)]
    pub data: Vec<u8>,
    #[serde(with = "timespan")]
    pub duration: Duration,
}

impl CustomClass {
    pub fn new(name: &str, age: u32, data: Vec<u8>, duration: Duration) -> Self {
        Self {
            name: name.to_string(),
            age,
            data,
            duration,
        }
    }
}

impl fmt::Display for CustomClass {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{{Name: {}, Age: {}, Duration: {}, Data: {:?}}}",
            self.name,
            self.age,
            timespan::format(self.duration),
            self.data
        )
    }
}

mod timespan {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    pub fn format(d: Duration) -> String {
        let secs = d.as_secs();
        format!("{:02}:{:02}:{:02}", secs / 3600, (secs / 60) % 60, secs % 60)
    }

    pub fn parse(s: &str) -> Result<Duration, String> {
        let parts: Vec<&str> = s.split(':').collect();
        let [h, m, sec] = parts.as_slice() else {
            return Err(format!("invalid duration '{s}', expected hh:mm:ss"));
        };
        let field = |v: &str| v.parse::<u64>().map_err(|e| format!("invalid duration '{s}': {e}"));
        Ok(Duration::from_secs(field(h)? * 3600 + field(m)? * 60 + field(sec)?))
    }

    pub fn serialize<S: Serializer>(d: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&format(*d))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        let s = String::deserialize(deserializer)?;
        parse(&s).map_err(serde::de::Error::custom)
    }
}

fn join<T: fmt::Display>(items: &[T]) -> String {
    items.iter().map(ToString::to_string).collect::<Vec<_>>().join(", ")
}

pub fn register(mut regs: Registries, _env: &AppEnv) -> Registries {
    regs.orchestrations = regs
        .orchestrations
        .register_typed(ACTIVITY_INPUT_TYPE_ORCHESTRATOR, activity_input_type);

    regs.activities = regs
        .activities
        .register_typed(BYTE_ARRAY_INPUT, |_ctx, input: Vec<u8>| async move {
            Ok::<_, String>(format!("Received byte[]: [{}]", join(&input)))
        })
        .register_typed(SINGLE_BYTE_INPUT, |_ctx, input: u8| async move {
            Ok::<_, String>(format!("Received byte: {input}"))
        })
        .register_typed(CUSTOM_CLASS_INPUT, |_ctx, input: CustomClass| async move {
            Ok::<_, String>(format!("Received CustomClass: {input}"))
        })
        .register_typed(INT_ARRAY_INPUT, |_ctx, input: Vec<i32>| async move {
            Ok::<_, String>(format!("Received int[]: [{}]", join(&input)))
        })
        .register_typed(STRING_INPUT, |_ctx, input: String| async move {
            Ok::<_, String>(format!("Received string: {input}"))
        })
        .register_typed(CUSTOM_CLASS_ARRAY_INPUT, |_ctx, input: Vec<CustomClass>| async move {
            Ok::<_, String>(format!("Received CustomClass[]: [{}]", join(&input)))
        });
    regs
}

async fn activity_input_type(ctx: OrchestrationContext, _input: Option<String>) -> Result<Vec<String>, String> {
    let mut output = Vec::new();

    let bytes: Vec<u8> = vec![1, 2, 3, 4, 5];
    output.push(call(&ctx, BYTE_ARRAY_INPUT, &bytes).await?);
    output.push(call(&ctx, BYTE_ARRAY_INPUT, &Vec::<u8>::new()).await?);
    output.push(call(&ctx, SINGLE_BYTE_INPUT, &42u8).await?);

    let custom = CustomClass::new("Test", 25, vec![1, 2, 3], Duration::from_secs(3600));
    output.push(call(&ctx, CUSTOM_CLASS_INPUT, &custom).await?);

    output.push(call(&ctx, INT_ARRAY_INPUT, &[1, 2, 3, 4, 5]).await?);
    output.push(call(&ctx, STRING_INPUT, &"Test string input").await?);

    let many = vec![
        CustomClass::new("Test1", 25, vec![1, 2, 3], Duration::from_secs(30 * 60)),
        CustomClass::new("Test2", 30, Vec::new(), Duration::from_secs(45 * 60)),
    ];
    output.push(call(&ctx, CUSTOM_CLASS_ARRAY_INPUT, &many).await?);

    Ok(output)
}

async fn call<T: Serialize>(ctx: &OrchestrationContext, name: &str, input: &T) -> Result<String, String> {
    ctx.schedule_activity_typed(name, input).into_activity_typed::<String>().await
}
