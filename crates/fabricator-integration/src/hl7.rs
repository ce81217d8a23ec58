//! HL7申请单解析模块
//!
//! 把HL7 v2.x ORM申请消息解析为规范化的 [`OrderRecord`]：
//! - MSH：分隔符、消息类型、控制ID
//! - PID：患者ID、姓名、出生日期、性别（只取第一个PID）
//! - ORC：检查号（后备）
//! - OBR：每个OBR对应一个请求序列

use crate::modality::{infer_modality, normalize_modality};
use chrono::{NaiveDate, NaiveTime};
use fabricator_core::{FabricatorError, OrderRecord, RequestedSeries, Result, Sex};
use regex::Regex;
use std::sync::LazyLock;
use tracing::{debug, info, warn};

// YYYYMMDD[HHMM[SS[.S+]]][+/-ZZZZ]
static HL7_TIMESTAMP: LazyLock<Option<Regex>> = LazyLock::new(|| {
    Regex::new(r"^(\d{4})(\d{2})(\d{2})(?:(\d{2})(\d{2})(?:(\d{2})(?:\.\d{1,4})?)?)?(?:[+-]\d{4})?$").ok()
});

/// 消息编码字符
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Delimiters {
    pub field: char,
    pub component: char,
    pub repetition: char,
    pub escape: char,
    pub subcomponent: char,
}

impl Default for Delimiters {
    fn default() -> Self {
        Self {
            field: '|',
            component: '^',
            repetition: '~',
            escape: '\\',
            subcomponent: '&',
        }
    }
}

impl Delimiters {
    /// 从MSH头读取分隔符：MSH后第一个字符为字段分隔符，MSH-2为编码字符
    fn from_header(header: &str) -> Result<Self> {
        let mut chars = header.chars().skip(3);
        let field = chars
            .next()
            .ok_or_else(|| FabricatorError::malformed("MSH", "header has no field separator"))?;
        if field.is_alphanumeric() {
            return Err(FabricatorError::malformed("MSH", format!("invalid field separator '{}'", field)));
        }

        let encoding: Vec<char> = chars.take_while(|c| *c != field).collect();
        let defaults = Self::default();
        Ok(Self {
            field,
            component: encoding.first().copied().unwrap_or(defaults.component),
            repetition: encoding.get(1).copied().unwrap_or(defaults.repetition),
            escape: encoding.get(2).copied().unwrap_or(defaults.escape),
            subcomponent: encoding.get(3).copied().unwrap_or(defaults.subcomponent),
        })
    }
}

/// 已拆分字段的段
#[derive(Debug, Clone)]
struct Segment<'a> {
    name: &'a str,
    fields: Vec<&'a str>,
}

impl<'a> Segment<'a> {
    fn parse(line: &'a str, delimiters: &Delimiters) -> Self {
        let mut parts: Vec<&str> = line.split(delimiters.field).collect();
        let name = parts.remove(0);
        if name == "MSH" {
            // MSH-1 是字段分隔符本身，不参与拆分
            parts.insert(0, "");
        }
        Self { name, fields: parts }
    }

    /// 原始字段（1起始编号）
    fn field(&self, index: usize) -> &'a str {
        index
            .checked_sub(1)
            .and_then(|i| self.fields.get(i))
            .copied()
            .unwrap_or("")
    }
}

/// 申请单解析器
#[derive(Debug, Clone, Default)]
pub struct OrderMessageParser;

impl OrderMessageParser {
    /// 创建新的申请单解析器
    pub fn new() -> Self {
        Self
    }

    /// 解析申请消息
    pub fn parse(&self, raw: &str) -> Result<OrderRecord> {
        let lines: Vec<&str> = raw
            .split(['\r', '\n'])
            .map(str::trim_end)
            .filter(|line| !line.trim().is_empty())
            .collect();

        let header = match lines.first() {
            Some(line) if line.starts_with("MSH") => *line,
            _ => return Err(FabricatorError::malformed("MSH", "message must start with an MSH header")),
        };
        let delimiters = Delimiters::from_header(header)?;
        let segments: Vec<Segment> = lines.iter().map(|line| Segment::parse(line, &delimiters)).collect();

        let mut order = OrderRecord::default();
        let msh = &segments[0];
        order.message_type = self.components(msh.field(9), &delimiters).join("^");
        order.control_id = self.component(msh.field(10), 0, &delimiters);

        let mut pid_seen = false;
        let mut orc_accession = String::new();
        let mut obr_accession = String::new();
        let mut has_order_segment = false;

        for segment in segments.iter().skip(1) {
            match segment.name {
                "PID" if !pid_seen => {
                    pid_seen = true;
                    self.read_pid(segment, &delimiters, &mut order)?;
                }
                "PID" => debug!("Ignoring additional PID segment"),
                "ORC" => {
                    has_order_segment = true;
                    if orc_accession.is_empty() {
                        orc_accession = self.component(segment.field(3), 0, &delimiters);
                    }
                }
                "OBR" => {
                    has_order_segment = true;
                    let accession = self.component(segment.field(3), 0, &delimiters);
                    if obr_accession.is_empty() {
                        obr_accession = accession;
                    }
                    self.read_obr(segment, &delimiters, &mut order)?;
                }
                other => debug!("Skipping segment {}", other),
            }
        }

        if !pid_seen {
            return Err(FabricatorError::malformed("PID", "message has no PID segment"));
        }
        if !has_order_segment {
            return Err(FabricatorError::malformed("ORC", "message has neither ORC nor OBR segment"));
        }

        order.accession_number = if obr_accession.is_empty() { orc_accession } else { obr_accession };
        order.requested_procedure = order
            .series
            .first()
            .map(|s| s.description.clone())
            .unwrap_or_default();

        info!(
            "Parsed order {} for patient {} ({} requested series, accession: {})",
            order.control_id,
            order.patient_id,
            order.series.len(),
            if order.accession_number.is_empty() { "<allocate>" } else { order.accession_number.as_str() }
        );
        Ok(order)
    }

    fn read_pid(&self, segment: &Segment, delimiters: &Delimiters, order: &mut OrderRecord) -> Result<()> {
        order.patient_id = self.component(segment.field(3), 0, delimiters).trim().to_string();
        if order.patient_id.is_empty() {
            return Err(FabricatorError::malformed("PID", "PID-3 patient identifier is empty"));
        }

        let mut name = self.components(segment.field(5), delimiters);
        while name.last().is_some_and(|part| part.is_empty()) {
            name.pop();
        }
        order.patient_name = name.join("^");

        let birth = self.component(segment.field(7), 0, delimiters);
        order.birth_date = parse_hl7_date(&birth);
        if order.birth_date.is_none() && !birth.is_empty() {
            warn!("Ignoring unparseable PID-7 birth date '{}'", birth);
        }

        order.sex = Sex::from_code(&self.component(segment.field(8), 0, delimiters));
        Ok(())
    }

    fn read_obr(&self, segment: &Segment, delimiters: &Delimiters, order: &mut OrderRecord) -> Result<()> {
        let code = self.component(segment.field(4), 0, delimiters).trim().to_string();
        let text = self.component(segment.field(4), 1, delimiters).trim().to_string();
        let description = if text.is_empty() { code.clone() } else { text };

        let observation = self.component(segment.field(7), 0, delimiters);
        if !observation.is_empty() {
            let date = parse_hl7_date(&observation).ok_or_else(|| {
                FabricatorError::malformed("OBR", format!("OBR-7 '{}' is not a valid HL7 date/time", observation))
            })?;
            if order.study_date.is_none() {
                order.study_date = Some(date);
            }
        }

        let modality = normalize_modality(&self.component(segment.field(24), 0, delimiters))
            .unwrap_or_else(|| infer_modality(&format!("{} {}", description, code)).to_string());

        order.series.push(RequestedSeries {
            procedure_code: code,
            description,
            modality,
        });
        Ok(())
    }

    /// 字段的第一个重复中的第 `index` 个组件（已解码）
    fn component(&self, field: &str, index: usize, delimiters: &Delimiters) -> String {
        self.components(field, delimiters).into_iter().nth(index).unwrap_or_default()
    }

    fn components(&self, field: &str, delimiters: &Delimiters) -> Vec<String> {
        let first = field.split(delimiters.repetition).next().unwrap_or("");
        if first.is_empty() {
            return Vec::new();
        }
        first
            .split(delimiters.component)
            .map(|component| {
                let primary = component.split(delimiters.subcomponent).next().unwrap_or("");
                decode_escapes(primary, delimiters)
            })
            .collect()
    }
}

/// 解码 `\F\ \S\ \T\ \R\ \E\`，其他格式化转义（如 `\.br\`）替换为空格
pub fn decode_escapes(value: &str, delimiters: &Delimiters) -> String {
    let escape = delimiters.escape;
    if !value.contains(escape) {
        return value.to_string();
    }

    let mut decoded = String::with_capacity(value.len());
    let mut rest = value;
    while let Some(start) = rest.find(escape) {
        decoded.push_str(&rest[..start]);
        let after = &rest[start + escape.len_utf8()..];
        match after.find(escape) {
            Some(end) => {
                match &after[..end] {
                    "F" => decoded.push(delimiters.field),
                    "S" => decoded.push(delimiters.component),
                    "T" => decoded.push(delimiters.subcomponent),
                    "R" => decoded.push(delimiters.repetition),
                    "E" => decoded.push(escape),
                    _ => decoded.push(' '),
                }
                rest = &after[end + escape.len_utf8()..];
            }
            None => {
                // 未闭合的转义按字面保留
                decoded.push_str(&rest[start..]);
                rest = "";
            }
        }
    }
    decoded.push_str(rest);
    decoded
}

/// 解析HL7日期/时间，返回日期部分
pub fn parse_hl7_date(value: &str) -> Option<NaiveDate> {
    let regex = HL7_TIMESTAMP.as_ref()?;
    let captures = regex.captures(value.trim())?;
    let number = |i: usize| captures.get(i).and_then(|m| m.as_str().parse::<u32>().ok());

    let year = captures.get(1)?.as_str().parse::<i32>().ok()?;
    let date = NaiveDate::from_ymd_opt(year, number(2)?, number(3)?)?;
    if let (Some(hour), Some(minute)) = (number(4), number(5)) {
        NaiveTime::from_hms_opt(hour, minute, number(6).unwrap_or(0))?;
    }
    Some(date)
}
