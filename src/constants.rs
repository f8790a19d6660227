// Trapstore Constants
// Table and column names are part of the store file format. Do not rename.

pub const STORE_VERSION: &str = "2.3.0.0";
pub const BACKWARDS_COMPATIBILITY_VERSION: &str = "2.3.0.0";
pub const STORE_EXTENSION: &str = "ddb";

// Tables
pub const TEMPLATE_TABLE: &str = "TemplateTable";
pub const DATA_TABLE: &str = "DataTable";
pub const IMAGE_SET_TABLE: &str = "ImageSetTable";
pub const MARKERS_TABLE: &str = "MarkersTable";
pub const INFO_TABLE: &str = "Info";
pub const DETECTION_CATEGORIES_TABLE: &str = "DetectionCategories";
pub const CLASSIFICATION_CATEGORIES_TABLE: &str = "ClassificationCategories";
pub const DETECTIONS_TABLE: &str = "Detections";
pub const CLASSIFICATIONS_TABLE: &str = "Classifications";
pub const FOLDER_INFO_TABLE: &str = "FolderDataInfo";
pub const FOLDER_TEMPLATE_TABLE: &str = "FolderDataTemplateTable";
pub const LEVEL_TABLE_PREFIX: &str = "Level";

// Shared columns
pub const ID: &str = "Id";
pub const FOLDER_DATA_PATH: &str = "FolderDataPath";

// Template columns
pub const CONTROL_ORDER: &str = "ControlOrder";
pub const SPREADSHEET_ORDER: &str = "SpreadsheetOrder";
pub const TYPE: &str = "Type";
pub const DEFAULT_VALUE: &str = "DefaultValue";
pub const LABEL: &str = "Label";
pub const DATA_LABEL: &str = "DataLabel";
pub const TOOLTIP: &str = "Tooltip";
pub const WIDTH: &str = "TextBoxWidth";
pub const COPYABLE: &str = "Copyable";
pub const VISIBLE: &str = "Visible";
pub const LIST: &str = "List";
pub const EXPORT_TO_CSV: &str = "ExportToCSV";
pub const LEVEL: &str = "Level";

// Standard fields, in control order
pub const FILE: &str = "File";
pub const RELATIVE_PATH: &str = "RelativePath";
pub const DATE_TIME: &str = "DateTime";
pub const DELETE_FLAG: &str = "DeleteFlag";
pub const STANDARD_FIELDS: [&str; 4] = [FILE, RELATIVE_PATH, DATE_TIME, DELETE_FLAG];

// Legacy and synthetic CSV columns
pub const DATE: &str = "Date";
pub const TIME: &str = "Time";
pub const FOLDER: &str = "Folder";
pub const IMAGE_QUALITY: &str = "ImageQuality";
pub const ROOT_FOLDER: &str = "RootFolder";
pub const TOLERATED_CSV_HEADERS: [&str; 5] = [DATE, TIME, FOLDER, IMAGE_QUALITY, ROOT_FOLDER];

// Image set columns
pub const IMAGE_SET_SORT_TERMS: &str = "SortTerms";
pub const IMAGE_SET_SEARCH_TERMS: &str = "SearchTerms";
pub const IMAGE_SET_ROW_ID: i64 = 1;

// Folder info columns
pub const GUID: &str = "Guid";
pub const ALIAS: &str = "Alias";

// Recognition columns
pub const DETECTION_ID: &str = "detectionID";
pub const CLASSIFICATION_ID: &str = "classificationID";
pub const CATEGORY: &str = "category";
pub const CATEGORY_LABEL: &str = "label";
pub const CATEGORY_DESCRIPTION: &str = "description";
pub const CONF: &str = "conf";
pub const BBOX: &str = "bbox";
pub const INFO_ID: &str = "infoID";
pub const INFO_DETECTOR: &str = "detector";
pub const INFO_DETECTOR_VERSION: &str = "megadetector_version";
pub const INFO_DETECTION_COMPLETION_TIME: &str = "detection_completion_time";
pub const INFO_CLASSIFIER: &str = "classifier";
pub const INFO_CLASSIFICATION_COMPLETION_TIME: &str = "classification_completion_time";
pub const INFO_TYPICAL_DETECTION_THRESHOLD: &str = "typical_detection_threshold";
pub const INFO_CONSERVATIVE_DETECTION_THRESHOLD: &str = "conservative_detection_threshold";
pub const INFO_TYPICAL_CLASSIFICATION_THRESHOLD: &str = "typical_classification_threshold";

// Recognition defaults and unknown markers
pub const DETECTOR_UNKNOWN: &str = "megadetector_unknown_version";
pub const DETECTOR_VERSION_UNKNOWN: &str = "vUnknown";
pub const COMPLETION_TIME_UNKNOWN: &str = "unknown";
pub const CLASSIFIER_UNKNOWN: &str = "ecosystem1_unknown_version";
pub const DEFAULT_TYPICAL_DETECTION_THRESHOLD: f64 = 0.2;
pub const DEFAULT_CONSERVATIVE_DETECTION_THRESHOLD: f64 = 0.05;
pub const DEFAULT_TYPICAL_CLASSIFICATION_THRESHOLD: f64 = 0.5;
pub const BB_DISPLAY_THRESHOLD_UNDEFINED: f64 = -1.0;

// Values
pub const FLAG_TRUE: &str = "true";
pub const FLAG_FALSE: &str = "false";
pub const DEFAULT_MARKER_VALUE: &str = "[]";
pub const DEFAULT_DATE_TIME: &str = "1900-01-01 12:00:00";
pub const EPISODE_KEY_SEPARATOR: char = ':';

// Paths
pub const PATH_SEPARATOR: char = '\\';
pub const BACKUP_FOLDER: &str = "Backups";
pub const CONFIG_FILENAME: &str = "trapstore.json";

// Date/time formats
pub const DATE_TIME_FORMAT: &str = "%Y-%m-%d %H:%M:%S";
pub const DATE_TIME_T_FORMAT: &str = "%Y-%m-%dT%H:%M:%S";
pub const LEGACY_DATE_FORMAT: &str = "%d-%b-%Y";
pub const LEGACY_TIME_FORMAT: &str = "%H:%M:%S";
pub const BACKUP_TIMESTAMP_FORMAT: &str = "%Y-%m-%d.%H-%M-%S";

// Batching
pub const DEFAULT_INSERT_BATCH_SIZE: usize = 5000;
pub const DEFAULT_IMPORT_BATCH_SIZE: usize = 2000;
pub const DEFAULT_MAX_REPORTED_ERROR_ROWS: usize = 2;

// Backups
pub const DEFAULT_BACKUP_INTERVAL_MINUTES: u64 = 30;
pub const DEFAULT_BACKUPS_TO_KEEP: usize = 8;

// Progress
pub const DEFAULT_PROGRESS_INTERVAL_MS: u64 = 250;
pub const DEFAULT_BACKOFF_MS: u64 = 10;

// Sorting
pub const MAX_SORT_KEYS: usize = 2;
