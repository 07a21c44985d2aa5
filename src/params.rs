//! Tool parameter descriptors and their command-line rendering.
//!
//! A descriptor declares one configurable value of a step. Values are read
//! from the job parameter map under `"<StepType>.<Provider>.<Param>"` (with a
//! `.<idx>` suffix when a provider appears more than once in a job) and
//! converted on demand through [`ParamValue`].

use std::path::PathBuf;

use serde::Serialize;
use serde_json::Value;
use tracing::debug;

use crate::error::{PipelineJobError, Result};
use crate::job::PipelineJob;
use crate::pipeline::PipelineStepProvider;
use crate::support::{ExpData, MetadataStore, SequenceJobSupport};

/// How a resolved parameter value is rendered onto a command line.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "kind", content = "arg", rename_all = "camelCase")]
pub enum CommandLineParam {
    /// `--arg value`, or `--arg<sep>value` when a separator is requested.
    Named(String),
    /// `--arg` when the value is true, nothing otherwise.
    Switch(String),
    /// The bare value.
    Positional,
}

impl CommandLineParam {
    pub fn create(arg: impl Into<String>) -> Self {
        Self::Named(arg.into())
    }

    pub fn create_switch(arg: impl Into<String>) -> Self {
        Self::Switch(arg.into())
    }

    pub fn arg_name(&self) -> Option<&str> {
        match self {
            Self::Named(arg) | Self::Switch(arg) => Some(arg),
            Self::Positional => None,
        }
    }

    /// Renders `value` into zero or more tokens. Empty values render nothing.
    pub fn render(&self, key: &str, value: &str, separator: Option<&str>) -> Result<Vec<String>> {
        let value = value.trim();
        if value.is_empty() {
            return Ok(Vec::new());
        }

        let tokens = match self {
            Self::Named(arg) => match separator {
                Some(sep) => vec![format!("{arg}{sep}{value}")],
                None => vec![arg.clone(), value.to_string()],
            },
            Self::Switch(arg) => {
                if bool::from_param(key, value)? {
                    vec![arg.clone()]
                } else {
                    Vec::new()
                }
            }
            Self::Positional => vec![value.to_string()],
        };
        Ok(tokens)
    }
}

/// Conversion from the raw string stored in a job's parameter map.
pub trait ParamValue: Sized {
    fn from_param(key: &str, raw: &str) -> Result<Self>;
}

impl ParamValue for String {
    fn from_param(_key: &str, raw: &str) -> Result<Self> {
        Ok(raw.to_string())
    }
}

impl ParamValue for PathBuf {
    fn from_param(_key: &str, raw: &str) -> Result<Self> {
        Ok(PathBuf::from(raw.trim()))
    }
}

impl ParamValue for bool {
    fn from_param(key: &str, raw: &str) -> Result<Self> {
        match raw.trim().to_ascii_lowercase().as_str() {
            "true" | "yes" | "on" | "1" | "t" | "y" => Ok(true),
            "false" | "no" | "off" | "0" | "f" | "n" => Ok(false),
            _ => Err(PipelineJobError::invalid_parameter(
                key,
                raw,
                "expected a boolean",
            )),
        }
    }
}

impl ParamValue for f64 {
    fn from_param(key: &str, raw: &str) -> Result<Self> {
        raw.trim()
            .parse()
            .map_err(|err: std::num::ParseFloatError| {
                PipelineJobError::invalid_parameter(key, raw, err.to_string())
            })
    }
}

macro_rules! integer_param_value {
    ($($ty:ty),*) => {
        $(
            impl ParamValue for $ty {
                fn from_param(key: &str, raw: &str) -> Result<Self> {
                    raw.trim()
                        .parse()
                        .map_err(|err: std::num::ParseIntError| {
                            PipelineJobError::invalid_parameter(key, raw, err.to_string())
                        })
                }
            }
        )*
    };
}

integer_param_value!(i32, i64, u32, u64, usize);

/// Converts a raw job value with the same rules used by [`ToolParameterDescriptor::extract_value`].
pub fn convert<T: ParamValue>(key: &str, raw: &str) -> Result<T> {
    T::from_param(key, raw)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub enum ParamKind {
    Plain,
    /// Holds the numeric id of a data file that must be cached before remote execution.
    ExpData,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ToolParameterDescriptor {
    name: String,
    label: String,
    description: String,
    field_xtype: String,
    default_value: Option<Value>,
    additional_ext_config: Option<Value>,
    command_line_param: Option<CommandLineParam>,
    kind: ParamKind,
}

impl ToolParameterDescriptor {
    pub fn create(
        name: impl Into<String>,
        label: impl Into<String>,
        description: impl Into<String>,
        field_xtype: impl Into<String>,
        additional_ext_config: Option<Value>,
        default_value: Option<Value>,
    ) -> Self {
        Self {
            name: name.into(),
            label: label.into(),
            description: description.into(),
            field_xtype: field_xtype.into(),
            default_value,
            additional_ext_config,
            command_line_param: None,
            kind: ParamKind::Plain,
        }
    }

    pub fn create_command_line_param(
        param: CommandLineParam,
        name: impl Into<String>,
        label: impl Into<String>,
        description: impl Into<String>,
        field_xtype: impl Into<String>,
        additional_ext_config: Option<Value>,
        default_value: Option<Value>,
    ) -> Self {
        let mut descriptor = Self::create(
            name,
            label,
            description,
            field_xtype,
            additional_ext_config,
            default_value,
        );
        descriptor.command_line_param = Some(param);
        descriptor
    }

    pub fn create_exp_data_param(
        name: impl Into<String>,
        label: impl Into<String>,
        description: impl Into<String>,
        field_xtype: impl Into<String>,
        additional_ext_config: Option<Value>,
        default_value: Option<Value>,
    ) -> Self {
        let mut descriptor = Self::create(
            name,
            label,
            description,
            field_xtype,
            additional_ext_config,
            default_value,
        );
        descriptor.kind = ParamKind::ExpData;
        descriptor
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn label(&self) -> &str {
        &self.label
    }

    pub fn description(&self) -> &str {
        &self.description
    }

    pub fn field_xtype(&self) -> &str {
        &self.field_xtype
    }

    pub fn default_value(&self) -> Option<&Value> {
        self.default_value.as_ref()
    }

    pub fn additional_ext_config(&self) -> Option<&Value> {
        self.additional_ext_config.as_ref()
    }

    pub fn command_line_param(&self) -> Option<&CommandLineParam> {
        self.command_line_param.as_ref()
    }

    pub fn kind(&self) -> ParamKind {
        self.kind
    }

    pub fn to_json(&self) -> Value {
        let mut value = serde_json::to_value(self).unwrap_or(Value::Null);
        if let Some(map) = value.as_object_mut() {
            map.insert(
                "commandLineParam".into(),
                self.command_line_param
                    .as_ref()
                    .and_then(CommandLineParam::arg_name)
                    .map_or(Value::Null, |arg| Value::String(arg.to_string())),
            );
        }
        value
    }

    /// Job parameter key for this descriptor under `provider`.
    pub fn job_param_key(&self, provider: &PipelineStepProvider, step_idx: usize) -> String {
        let mut key = format!(
            "{}.{}.{}",
            provider.step_type().param_name(),
            provider.name(),
            self.name
        );
        if step_idx > 0 {
            key.push('.');
            key.push_str(&step_idx.to_string());
        }
        key
    }

    /// The raw job value, if any. Blank values count as absent.
    pub fn raw_value<'a>(
        &self,
        job: &'a PipelineJob,
        provider: &PipelineStepProvider,
        step_idx: usize,
    ) -> Option<&'a str> {
        job.parameter(&self.job_param_key(provider, step_idx))
            .filter(|value| !value.trim().is_empty())
    }

    pub fn extract_value<T: ParamValue>(
        &self,
        job: &PipelineJob,
        provider: &PipelineStepProvider,
    ) -> Result<Option<T>> {
        self.extract_value_at(job, provider, 0)
    }

    pub fn extract_value_at<T: ParamValue>(
        &self,
        job: &PipelineJob,
        provider: &PipelineStepProvider,
        step_idx: usize,
    ) -> Result<Option<T>> {
        let key = self.job_param_key(provider, step_idx);
        match self.raw_value(job, provider, step_idx) {
            Some(raw) => convert(&key, raw).map(Some),
            None => Ok(None),
        }
    }

    /// Like [`extract_value_at`](Self::extract_value_at), falling back to `default`.
    pub fn extract_value_or_default<T: ParamValue>(
        &self,
        job: &PipelineJob,
        provider: &PipelineStepProvider,
        step_idx: usize,
        default: T,
    ) -> Result<T> {
        Ok(self
            .extract_value_at(job, provider, step_idx)?
            .unwrap_or(default))
    }

    /// Every value whose key starts with this descriptor's job key.
    pub fn extract_all_values<'a>(
        &self,
        job: &'a PipelineJob,
        provider: &PipelineStepProvider,
    ) -> Vec<&'a str> {
        let prefix = self.job_param_key(provider, 0);
        job.parameters()
            .iter()
            .filter(|(key, _)| key.starts_with(&prefix))
            .map(|(_, value)| value.as_str())
            .collect()
    }

    /// Tokens this descriptor contributes to a command line. Unbound
    /// descriptors and absent values contribute nothing.
    pub fn command_line_tokens(
        &self,
        job: &PipelineJob,
        provider: &PipelineStepProvider,
        step_idx: usize,
        separator: Option<&str>,
    ) -> Result<Vec<String>> {
        let Some(binding) = self.command_line_param.as_ref() else {
            return Ok(Vec::new());
        };
        match self.raw_value(job, provider, step_idx) {
            Some(raw) => binding.render(&self.job_param_key(provider, step_idx), raw, separator),
            None => Ok(Vec::new()),
        }
    }

    /// Caches the referenced data file when this is a data-file parameter.
    pub fn cache_value(
        &self,
        job: &PipelineJob,
        provider: &PipelineStepProvider,
        step_idx: usize,
        support: &mut SequenceJobSupport,
        store: &dyn MetadataStore,
    ) -> Result<()> {
        if self.kind != ParamKind::ExpData {
            return Ok(());
        }
        let Some(data_id) = self.extract_value_at::<i64>(job, provider, step_idx)? else {
            return Ok(());
        };
        debug!(data_id, parameter = self.name.as_str(), "Caching data file");
        if let Some(file) = store.data_file(data_id) {
            support.cache_exp_data(ExpData::new(data_id, file));
        }
        Ok(())
    }
}
