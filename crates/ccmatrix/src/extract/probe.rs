//! `ping` summary parsing.

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RttSummary {
    pub min: f64,
    pub avg: f64,
    pub max: f64,
    pub mdev: f64,
}

#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct ProbeSummary {
    pub rtt: Option<RttSummary>,
    pub loss_pct: Option<f64>,
}

/// Pull the RTT summary (`min/avg/max/mdev = a/b/c/d`) and the loss
/// percentage out of probe output. Either half may be missing.
pub fn parse_probe(text: &str) -> ProbeSummary {
    ProbeSummary {
        rtt: parse_rtt(text),
        loss_pct: parse_loss(text),
    }
}

fn parse_rtt(text: &str) -> Option<RttSummary> {
    let line = text
        .lines()
        .find(|l| l.contains("min/avg/max/mdev") || l.contains("min/avg/max/stddev"))?;
    let (_, values) = line.split_once('=')?;
    let values = values.split_whitespace().next()?;
    let mut parts = values.split('/').map(|v| v.parse::<f64>().ok());
    let summary = RttSummary {
        min: parts.next()??,
        avg: parts.next()??,
        max: parts.next()??,
        mdev: parts.next()??,
    };
    Some(summary)
}

fn parse_loss(text: &str) -> Option<f64> {
    let idx = text.find("% packet loss")?;
    let before = &text[..idx];
    let number = before
        .rsplit(|c: char| c.is_whitespace() || c == ',')
        .next()?;
    number.parse().ok()
}
