/// Known inverter type strings and their model names.
const MODELS_BY_TYPE: &[(&str, &str)] = &[
    ("2500xi", "Powador 2500xi"),
    ("3000xi", "Powador 3000xi"),
    ("3500xi", "Powador 3500xi"),
    ("3600xi", "Powador 3600xi"),
    ("4000xi", "Powador 4000xi"),
    ("4500xi", "Powador 4500xi"),
    ("5000xi", "Powador 5000xi"),
    ("6400xi", "Powador 6400xi"),
    ("6650xi", "Powador 6650xi"),
    ("7200xi", "Powador 7200xi"),
    ("8000xi", "Powador 8000xi"),
    ("4000su", "Powador 4000 supreme"),
    ("6400su", "Powador 6400 supreme"),
    ("6650su", "Powador 6650 supreme"),
    ("7200su", "Powador 7200 supreme"),
    ("8000su", "Powador 8000 supreme"),
    ("020L11", "blueplanet 2.0 TL1"),
    ("026L11", "blueplanet 2.6 TL1"),
    ("030L11", "blueplanet 3.0 TL1"),
    ("030L12", "blueplanet 3.0 TL1-M2"),
    ("035L12", "blueplanet 3.5 TL1"),
    ("037L12", "blueplanet 3.7 TL1"),
    ("040L12", "blueplanet 4.0 TL1"),
    ("046L12", "blueplanet 4.6 TL1"),
    ("050L12", "blueplanet 5.0 TL1"),
    ("3200I", "Powador 3200 International version"),
    ("4200I", "Powador 4400 International version"),
    ("4400I", "Powador 4400 International version"),
    ("5300I", "Powador 5300 International version"),
    ("5500I", "Powador 5500 International version"),
    ("6600I", "Powador 6600 International version"),
    ("7700I", "Powador 7700 International version"),
    ("7900I", "Powador 7900 International version"),
    ("8600I", "Powador 8600 International version"),
    ("9600I", "Powador 9600 International version"),
    ("5300IS", "Powador 5300 supreme International version"),
    ("7700IS", "Powador 7700 supreme International version"),
    ("7900IS", "Powador 7900 supreme International version"),
    ("8600IS", "Powador 8600 supreme International version"),
    ("9600IS", "Powador 9600 supreme International version"),
    ("1501xi", "Powador 1501xi"),
    ("2501xi", "Powador 2501xi"),
    ("3501xi", "Powador 3501xi"),
    ("4501xi", "Powador 4501xi"),
    ("5001xi", "Powador 5001xi"),
    ("2002DE", "Powador 2002 German version"),
    ("3002DE", "Powador 3002 German version"),
    ("4202DE", "Powador 4202 German version"),
    ("5002DE", "Powador 5002 German version"),
    ("6002DE", "Powador 6002 German version"),
    ("2002IN", "Powador 2002 International version"),
    ("3002IN", "Powador 3002 International version"),
    ("4202IN", "Powador 4202 International version"),
    ("5002IN", "Powador 5002 International version"),
    ("6002IN", "Powador 6002 International version"),
    ("3000IN", "Powador 3000 SE"),
    ("8k1", "Powador 25000xi/1 Inverter unit 1"),
    ("8k2", "Powador 25000xi/2 Inverter unit 2"),
    ("8k3", "Powador 25000xi/3 inverter unit 3"),
    ("3x8k", "Powador 25000xi"),
    ("10k1", "Powador 30000xi/1 Inverter unit 1"),
    ("10k2", "Powador 30000xi/2 Inverter unit 2"),
    ("10k3", "Powador 30000xi/3 inverter unit 3"),
    ("3x10k", "Powador 30000xi"),
    ("11k1", "Powador 33000xi/1 Inverter unit 1"),
    ("11k2", "Powador 33000xi/2 Inverter unit 2"),
    ("11k3", "Powador 33000xi/3 inverter unit 3"),
    ("3x11k", "Powador 33000xi"),
    ("030L32", "blueplanet 3.0 TL3"),
    ("040L32", "blueplanet 4.0 TL3"),
    ("050L32", "blueplanet 5.0 TL3"),
    ("065L32", "blueplanet 6.5 TL3"),
    ("075L32", "blueplanet 7.5 TL3"),
    ("086L32", "blueplanet 8.6 TL3"),
    ("090L32", "blueplanet 9.0 TL3"),
    ("100L32", "blueplanet 10.0 TL3"),
    ("150L32", "blueplanet 15.0 TL3"),
    ("200L32", "blueplanet 20.0 TL3"),
    ("03X24", "blueplanet 3.0NX3 M2"),
    ("05X24", "blueplanet 5.0NX3 M2"),
    ("08X24", "blueplanet 8.0NX3 M2"),
    ("10X24", "blueplanet 10.0NX3 M2"),
    ("12X24", "blueplanet 12.0NX3 M2"),
    ("15X24", "blueplanet 15.0NX3 M2"),
    ("20X24", "blueplanet 20.0NX3 M2"),
    ("25X34", "blueplanet 25.0NX3 M3 WM"),
    ("30X34", "blueplanet 30.0NX3 M3 WM"),
    ("33X34", "blueplanet 33.0NX3 M3 WM"),
    ("120TL", "Powador 12.0 TL3"),
    ("140TL", "Powador 14.0 TL3"),
    ("180TL", "Powador 18.0 TL3"),
    ("200TL", "Powador 20.0 TL3"),
    ("300TL", "Powador 30.0 TL3"),
    ("330TL", "Powador 33.0 TL3"),
    ("360TL", "Powador 36.0 TL3"),
    ("360M1", "Powador 36.0 TL3 M1"),
    ("375TL", "Powador 37.5 TL3"),
    ("390TL", "Powador 39.0 TL3"),
    ("390M1", "Powador 39.0 TL3 M1"),
    ("400TL", "Powador 40.0 TL3"),
    ("480TL", "Powador 48.0 TL3"),
    ("600TL", "Powador 60.0 TL3"),
    ("720TL", "Powador 72.0 TL3"),
    ("29kH3P", "blueplanet 29.0 TL3 WM"),
    ("50KH3P", "blueplanet 50.0 TL3 WM"),
    ("50kH4P", "blueplanet 50.0 TL3 M1"),
    ("50kH4", "blueplanet 50.0 TL3 M3"),
    ("50kRPO", "blueplanet 50.0 TL3 RPO"),
    ("60kH3P", "blueplanet 60.0 TL3 M3"),
    ("BG0501", "blueplanet gridsave 50.0 TL3"),
    ("BG50TL", "blueplanet gridsave 50.0 TL3"),
    ("BQ50TL", "blueplanet voltage source 50.0 TL3"),
    ("092G14", "blueplanet gridsave 92.0 TL3"),
    ("110G15", "blueplanet gridsave 110 TL3"),
    ("137G16", "blueplanet gridsave 137 TL3"),
    ("160TR", "Powador 16.0 TR3"),
    ("180TR", "Powador 18.0 TR3"),
    ("100kTR", "Powador XP100-HV"),
    ("200kTR", "Powador XP200-HV"),
    ("200kTL", "Powador XP200-HV TL"),
    ("250kTR", "Powador XP250-HV"),
    ("250kTL", "Powador XP250-HV TL"),
    ("350kTL", "Powador XP350-HV TL"),
    ("500kTL", "Powador XP500-HV TL"),
    ("550kTL", "Powador XP550-HV TL"),
    ("750kTL", "blueplanet 750 TL3"),
    ("875kTL", "blueplanet 875 TL3"),
    ("1000kTL", "blueplanet 1000 TL3"),
    ("2901xi", "blueplanet 2901xi"),
    ("3601xi", "blueplanet 3601xi"),
    ("1502xi", "blueplanet 1502xi"),
    ("2502xi", "blueplanet 2502xi"),
    ("3502xi", "blueplanet 3502xi"),
    ("5002xi", "blueplanet 5002xi"),
    ("6400u", "blueplanet 6400xi supreme"),
    ("7600u", "blueplanet 7600xi supreme"),
    ("6400UM", "blueplanet 6400M"),
    ("7600UM", "blueplanet 7600M"),
    ("10kH4", "blueplanet XP10U-H4"),
    ("10kH6", "blueplanet XP10U-H6"),
    ("100kH2", "blueplanet XP100U-H2"),
    ("100kH4", "blueplanet XP100U-H4"),
    ("83kH6", "blueplanet XP83U-H6"),
    ("90kH6", "blueplanet XP90U-H6"),
    ("100kH6", "blueplanet XP100U-H6"),
    ("32kH4P", "blueplanet 32.0 TL3 M1 OD"),
    ("40kH4P", "blueplanet 40.0 TL3 M1 OD"),
    ("32kH4", "blueplanet 32.0 TL3 M3 OD"),
    ("40kH4", "blueplanet 40.0 TL3 M3 OD"),
    ("087N13", "blueplanet 87 TL3"),
    ("092N14", "blueplanet 92 TL3"),
    ("100N13", "blueplanet 100 TL3"),
    ("105N14", "blueplanet 105 TL3"),
    ("110N15", "blueplanet 110 TL3"),
    ("125N15", "blueplanet 125 TL3"),
    ("125N16", "blueplanet 125 TL3"),
    ("137N16", "blueplanet 137 TL3"),
    ("150N17", "blueplanet 150 TL3"),
    ("155N16", "blueplanet 155 TL3"),
    ("165N17", "blueplanet 165 TL3"),
];

/// Looks up the model name for the inverter type an inverter reports.
///
/// Some generic-protocol inverters drop the leading zero of their type
/// (`3X24` for `03X24`), so four character types are retried padded.
pub fn resolve_model_name(inverter_type: &str) -> Option<&'static str> {
    if inverter_type.is_empty() {
        return None;
    }
    lookup(inverter_type).or_else(|| {
        if inverter_type.len() == 4 {
            lookup(&format!("0{inverter_type}"))
        } else {
            None
        }
    })
}

fn lookup(inverter_type: &str) -> Option<&'static str> {
    MODELS_BY_TYPE
        .iter()
        .find(|(known, _)| *known == inverter_type)
        .map(|(_, model)| *model)
}
