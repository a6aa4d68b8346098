use crate::error::{VentError, VentResult};
use crate::state::{IeRatio, VentilationMode};

/// Cycle length assumed when a recording carries no breathing frequency.
pub const DEFAULT_TEMPLATE_CYCLE_MS: f64 = 4000.0;

const VC_RECORDING: &str = include_str!("../../data/vc_template.txt");
const PC_RECORDING: &str = include_str!("../../data/pc_template.txt");
const PS_RECORDING: &str = include_str!("../../data/ps_template.txt");

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TemplateBase {
    VolumeControl,
    PressureControl,
    PressureSupport,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct TemplateSample {
    /// Milliseconds since the start of the recorded breath.
    pub time_ms: f64,
    pub pressure: f64,
    pub flow: f64,
    pub volume: f64,
}

/// Ventilator settings captured in the recording header.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RecordedSettings {
    pub pressure_target: Option<f64>,
    pub ps_level: Option<f64>,
    pub peep: Option<f64>,
    pub frequency: Option<f64>,
    pub tidal_volume: Option<f64>,
    pub inspiratory_pause_percent: Option<f64>,
    pub ie_ratio: Option<IeRatio>,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PeakStatistics {
    pub pressure: f64,
    pub volume: f64,
    pub flow: f64,
}

/// One recorded breath cycle, immutable after parsing.
#[derive(Debug, Clone)]
pub struct TemplateDataset {
    pub base: TemplateBase,
    pub settings: RecordedSettings,
    pub samples: Vec<TemplateSample>,
    pub cycle_duration_ms: f64,
    pub peaks: PeakStatistics,
}

impl TemplateDataset {
    pub fn parse(content: &str, base: TemplateBase) -> VentResult<Self> {
        let mut parser = TemplateParser::new(content);
        parser.parse(base)
    }
}

struct RawRow {
    time_ms: f64,
    inspiratory: bool,
    pressure: f64,
    flow: f64,
    volume: f64,
}

struct TemplateParser {
    lines: Vec<String>,
    current_line: usize,
}

impl TemplateParser {
    fn new(content: &str) -> Self {
        let lines: Vec<String> = content
            .lines()
            .map(|line| line.trim_end().to_string())
            .filter(|line| !line.trim().is_empty())
            .collect();

        Self {
            lines,
            current_line: 0,
        }
    }

    fn parse(&mut self, base: TemplateBase) -> VentResult<TemplateDataset> {
        let mut settings = RecordedSettings::default();
        let mut rows = Vec::new();
        let mut data_seen = false;

        while self.current_line < self.lines.len() {
            let line = self.lines[self.current_line].trim();

            if line.starts_with("[DATA]") {
                data_seen = true;
                // column titles follow the section marker
                self.current_line += 2;
                rows = self.parse_data_block();
            } else if line.starts_with('[') || line.starts_with("==") {
                self.current_line += 1;
            } else {
                self.parse_setting_line(&mut settings);
                self.current_line += 1;
            }
        }

        if !data_seen {
            return Err(VentError::Dataset("Missing [DATA] section".to_string()));
        }
        if rows.len() < 2 {
            return Err(VentError::Dataset(format!(
                "Recording needs at least two samples, found {}",
                rows.len()
            )));
        }

        let cycle_duration_ms = match settings.frequency {
            Some(f) if f > 0.0 => 60_000.0 / f,
            _ => DEFAULT_TEMPLATE_CYCLE_MS,
        };

        // Time zero is the first inspiratory sample; earlier samples wrap to the cycle end.
        let origin = rows
            .iter()
            .find(|r| r.inspiratory)
            .map(|r| r.time_ms)
            .unwrap_or(rows[0].time_ms);

        let mut samples: Vec<TemplateSample> = rows
            .iter()
            .map(|r| TemplateSample {
                time_ms: (r.time_ms - origin).rem_euclid(cycle_duration_ms),
                pressure: r.pressure,
                flow: r.flow,
                volume: r.volume,
            })
            .collect();
        samples.sort_by(|a, b| a.time_ms.total_cmp(&b.time_ms));

        let peaks = PeakStatistics {
            pressure: samples.iter().map(|s| s.pressure).fold(f64::NEG_INFINITY, f64::max),
            volume: samples.iter().map(|s| s.volume).fold(f64::NEG_INFINITY, f64::max),
            flow: samples.iter().map(|s| s.flow).fold(f64::NEG_INFINITY, f64::max),
        };

        Ok(TemplateDataset {
            base,
            settings,
            samples,
            cycle_duration_ms,
            peaks,
        })
    }

    fn parse_setting_line(&self, settings: &mut RecordedSettings) {
        let line = &self.lines[self.current_line];
        let parts: Vec<&str> = line.split('\t').map(|p| p.trim()).collect();
        if parts.len() < 2 {
            return;
        }

        let key = parts[0];
        if key == "I:E" {
            settings.ie_ratio = IeRatio::try_parse(parts[1]);
            return;
        }

        let slot = match key {
            "PC sopra PEEP" => &mut settings.pressure_target,
            "PS sopra PEEP" => &mut settings.ps_level,
            "PEEP" => &mut settings.peep,
            "Freq. resp." | "Freq. SIMV" => &mut settings.frequency,
            "Volume corrente" => &mut settings.tidal_volume,
            "T pausa (%)" => &mut settings.inspiratory_pause_percent,
            _ => return,
        };
        if let Some(value) = parse_decimal(parts[1]) {
            *slot = Some(value);
        }
    }

    fn parse_data_block(&mut self) -> Vec<RawRow> {
        let mut rows = Vec::new();

        while self.current_line < self.lines.len() {
            let line = &self.lines[self.current_line];
            if line.starts_with('[') {
                break;
            }
            if let Some(row) = parse_data_row(line) {
                rows.push(row);
            }
            self.current_line += 1;
        }

        rows
    }
}

/// Recordings use a decimal comma.
fn parse_decimal(text: &str) -> Option<f64> {
    text.trim().replace(',', ".").parse::<f64>().ok().filter(|v| v.is_finite())
}

/// `HH:MM:SS:mmm` to milliseconds.
fn parse_timestamp(text: &str) -> Option<f64> {
    let parts: Vec<f64> = text
        .trim()
        .split(':')
        .map(|p| p.parse::<f64>().ok())
        .collect::<Option<Vec<_>>>()?;
    match parts.as_slice() {
        [h, m, s, ms] => Some((h * 3600.0 + m * 60.0 + s) * 1000.0 + ms),
        _ => None,
    }
}

/// Malformed rows are skipped.
fn parse_data_row(line: &str) -> Option<RawRow> {
    let parts: Vec<&str> = line.split('\t').collect();
    if parts.len() < 5 {
        return None;
    }

    Some(RawRow {
        time_ms: parse_timestamp(parts[0])?,
        inspiratory: parts[1].contains("insp"),
        pressure: parse_decimal(parts[2])?,
        flow: parse_decimal(parts[3])?,
        volume: parse_decimal(parts[4])?,
    })
}

/// The built-in recordings, parsed once at startup.
#[derive(Debug, Clone)]
pub struct TemplateLibrary {
    volume_control: TemplateDataset,
    pressure_control: TemplateDataset,
    pressure_support: TemplateDataset,
}

impl TemplateLibrary {
    pub fn load_builtin() -> VentResult<Self> {
        Ok(Self {
            volume_control: TemplateDataset::parse(VC_RECORDING, TemplateBase::VolumeControl)?,
            pressure_control: TemplateDataset::parse(PC_RECORDING, TemplateBase::PressureControl)?,
            pressure_support: TemplateDataset::parse(PS_RECORDING, TemplateBase::PressureSupport)?,
        })
    }

    /// PS and CPAP share the spontaneous recording; everything without its own
    /// recording falls back to pressure control.
    pub fn for_mode(&self, mode: VentilationMode) -> &TemplateDataset {
        match mode {
            VentilationMode::Vc => &self.volume_control,
            VentilationMode::Ps | VentilationMode::Cpap => &self.pressure_support,
            VentilationMode::Pc | VentilationMode::Simv | VentilationMode::HighFlow => &self.pressure_control,
        }
    }
}
