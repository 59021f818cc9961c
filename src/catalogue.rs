//! Named beam position monitors and the selectable display windows.

use once_cell::sync::OnceCell;

const CELLS: u8 = 24;
const BPMS_PER_CELL: u8 = 7;

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Bpm {
    pub name: String,
    pub id: u8,
}

/// BPMs grouped by storage ring cell. The first group, "Other", is empty and
/// stands for a channel entered by id.
#[derive(Clone, Debug)]
pub struct BpmGroup {
    pub name: String,
    pub bpms: Vec<Bpm>,
}

fn build_groups() -> Vec<BpmGroup> {
    let mut groups = vec![BpmGroup {
        name: "Other".to_owned(),
        bpms: Vec::new(),
    }];
    for cell in 1..=CELLS {
        let bpms = (1..=BPMS_PER_CELL)
            .map(|n| Bpm {
                name: format!("SR{cell:02}C-DI-EBPM-{n:02}"),
                id: BPMS_PER_CELL * (cell - 1) + n,
            })
            .collect();
        groups.push(BpmGroup {
            name: format!("Cell {cell}"),
            bpms,
        });
    }
    groups[21].bpms.push(Bpm {
        name: "SR21C-DI-EBPM-08".to_owned(),
        id: 169,
    });
    for n in 0..2u8 {
        groups[13].bpms.push(Bpm {
            name: format!("SR13S-DI-EBPM-{:02}", n + 1),
            id: 174 + n,
        });
    }
    groups
}

pub fn bpm_groups() -> &'static [BpmGroup] {
    static GROUPS: OnceCell<Vec<BpmGroup>> = OnceCell::new();
    GROUPS.get_or_init(build_groups)
}

pub fn bpms() -> impl Iterator<Item = &'static Bpm> {
    bpm_groups().iter().flat_map(|group| group.bpms.iter())
}

/// Case-insensitive lookup by BPM name.
pub fn find_bpm(name: &str) -> Option<&'static Bpm> {
    bpms().find(|bpm| bpm.name.eq_ignore_ascii_case(name.trim()))
}

pub fn bpm_by_id(id: u8) -> Option<&'static Bpm> {
    bpms().find(|bpm| bpm.id == id)
}

/// Status line naming the channel being viewed.
pub fn channel_label(id: u8) -> String {
    match bpm_by_id(id) {
        Some(bpm) => format!("BPM: {} (id {})", bpm.name, bpm.id),
        None => format!("BPM id {id}"),
    }
}

/// Selectable window lengths: label and number of samples.
pub const TIMEBASES: [(&str, usize); 9] = [
    ("100ms", 1000),
    ("250ms", 2500),
    ("0.5s", 5000),
    ("1s", 10_000),
    ("2.5s", 25_000),
    ("5s", 50_000),
    ("10s", 100_000),
    ("25s", 250_000),
    ("50s", 500_000),
];

/// Index into [`TIMEBASES`] of the one second window.
pub const INITIAL_TIMEBASE: usize = 3;

pub fn timebase_by_label(label: &str) -> Option<usize> {
    TIMEBASES
        .iter()
        .find(|(name, _)| *name == label.trim())
        .map(|&(_, samples)| samples)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cells_number_bpms_consecutively() {
        let groups = bpm_groups();
        assert_eq!(groups.len(), 25);
        assert!(groups[0].bpms.is_empty());
        assert_eq!(find_bpm("SR01C-DI-EBPM-01").map(|b| b.id), Some(1));
        assert_eq!(find_bpm("SR24C-DI-EBPM-07").map(|b| b.id), Some(168));
        assert_eq!(find_bpm("sr03c-di-ebpm-02").map(|b| b.id), Some(16));
        assert_eq!(groups[5].bpms.len(), 7);
    }

    #[test]
    fn extra_bpms_sit_in_their_cells() {
        let groups = bpm_groups();
        assert_eq!(groups[21].bpms.last().map(|b| b.id), Some(169));
        let straight: Vec<_> = groups[13].bpms[7..].iter().map(|b| b.id).collect();
        assert_eq!(straight, vec![174, 175]);
        assert_eq!(bpm_by_id(175).map(|b| b.name.as_str()), Some("SR13S-DI-EBPM-02"));
        assert!(bpm_by_id(170).is_none());
    }

    #[test]
    fn labels_fall_back_to_ids() {
        assert_eq!(channel_label(8), "BPM: SR02C-DI-EBPM-01 (id 8)");
        assert_eq!(channel_label(200), "BPM id 200");
    }

    #[test]
    fn timebases_fit_default_history() {
        assert_eq!(TIMEBASES[INITIAL_TIMEBASE].1, 10_000);
        assert_eq!(timebase_by_label("2.5s"), Some(25_000));
        assert_eq!(timebase_by_label("3s"), None);
        assert!(TIMEBASES.windows(2).all(|w| w[0].1 < w[1].1));
    }
}
